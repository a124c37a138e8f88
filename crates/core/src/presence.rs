//! Bare-to-full address resolution.
//!
//! File transfer needs a resource-qualified destination. [`PresenceResolver`]
//! finds one for a bare address, trying in order:
//!
//! 1. the per-key [`PresenceCache`]
//! 2. a presence probe, collecting answers for the timeout window and ranking
//!    them by priority, then recency
//! 3. a `disco#info` query whose reply comes from a resource of the account
//! 4. a `disco#items` query, taking the first resource of the account
//!
//! The first step that yields an address wins. Query failures inside a step
//! are logged and treated as "no result".
//!
//! After a key is first used, a passive tracker keeps the cache warm from
//! unsolicited presence pushes on that session.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use xft_protocol::{Element, Frame, Jid, PresenceUpdate, ns, stanza};
use xft_runtime::{EventRelay, Session, SessionManager, Subscription};

/// Default window for collecting probe answers.
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_millis(1200);

/// Best known resource of one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
	pub jid: Jid,
	pub priority: i8,
	pub observed: Instant,
}

impl PresenceEntry {
	/// Whether `candidate` should replace this entry.
	fn yields_to(&self, candidate: &PresenceEntry) -> bool {
		candidate.jid == self.jid
			|| candidate.priority > self.priority
			|| (candidate.priority == self.priority && candidate.observed >= self.observed)
	}
}

/// Best resource per bare address. Entries are only ever overwritten by
/// better candidates or refreshed by their own resource; nothing expires
/// them, unavailable presence included.
#[derive(Debug, Default)]
pub struct PresenceCache {
	entries: Mutex<HashMap<Jid, PresenceEntry>>,
}

impl PresenceCache {
	pub fn new() -> Self {
		Self::default()
	}

	/// Cached full address for `bare`.
	pub fn get(&self, bare: &Jid) -> Option<Jid> {
		self.entries.lock().get(&bare.bare()).map(|e| e.jid.clone())
	}

	pub fn entry(&self, bare: &Jid) -> Option<PresenceEntry> {
		self.entries.lock().get(&bare.bare()).cloned()
	}

	/// Records an available presence from a full address. Returns `true` if
	/// the cache changed.
	pub fn observe(&self, full: &Jid, priority: i8, observed: Instant) -> bool {
		if !full.is_full() {
			return false;
		}
		let candidate = PresenceEntry {
			jid: full.clone(),
			priority,
			observed,
		};

		let mut entries = self.entries.lock();
		match entries.get(&full.bare()) {
			Some(current) if !current.yields_to(&candidate) => false,
			_ => {
				entries.insert(full.bare(), candidate);
				true
			}
		}
	}

	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.lock().is_empty()
	}
}

/// Candidate from a probe answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
	pub jid: Jid,
	pub priority: i8,
	pub observed: Instant,
}

/// Picks the highest priority, then the most recent observation.
pub fn best_candidate(candidates: &[Candidate]) -> Option<&Candidate> {
	candidates.iter().max_by(|a, b| {
		a.priority
			.cmp(&b.priority)
			.then_with(|| a.observed.cmp(&b.observed))
	})
}

/// An available presence from a resource of `bare`, if `update` is one.
fn available_resource(update: &PresenceUpdate, bare: Option<&Jid>) -> Option<Jid> {
	if !update.is_available() {
		return None;
	}
	let from = update.envelope.from.as_ref()?;
	if !from.is_full() {
		return None;
	}
	match bare {
		Some(bare) if !from.shares_bare(bare) => None,
		_ => Some(from.clone()),
	}
}

struct Tracker {
	relay: Weak<EventRelay>,
	_subscription: Subscription,
}

#[derive(Default)]
struct KeyState {
	cache: Arc<PresenceCache>,
	tracker: Mutex<Option<Tracker>>,
}

/// Resolves bare addresses per session key. Cloning shares caches.
#[derive(Clone)]
pub struct PresenceResolver {
	sessions: SessionManager,
	keys: Arc<DashMap<String, Arc<KeyState>>>,
}

impl std::fmt::Debug for PresenceResolver {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PresenceResolver")
			.field("keys", &self.keys.len())
			.finish()
	}
}

impl PresenceResolver {
	pub fn new(sessions: SessionManager) -> Self {
		Self {
			sessions,
			keys: Arc::new(DashMap::new()),
		}
	}

	/// Cache of `key`, created on first use.
	pub fn cache(&self, key: &str) -> Arc<PresenceCache> {
		Arc::clone(&self.state(key).cache)
	}

	fn state(&self, key: &str) -> Arc<KeyState> {
		Arc::clone(self.keys.entry(key.to_string()).or_default().value())
	}

	/// Resolves `bare` to the best full address reachable from session `key`.
	///
	/// A full address is returned unchanged. `None` means every step came up
	/// empty; callers fall back to the bare address.
	pub async fn resolve(&self, key: &str, bare: &Jid, timeout: Duration) -> Option<Jid> {
		if bare.is_full() {
			return Some(bare.clone());
		}
		let Some(session) = self.sessions.session(key) else {
			tracing::debug!(key, "resolve on unknown session");
			return None;
		};
		let state = self.state(key);
		self.track(&state, &session);

		if let Some(jid) = state.cache.get(bare) {
			tracing::debug!(key, bare = %bare, jid = %jid, "resolved from cache");
			return Some(jid);
		}

		if let Some(candidate) = probe(&session, bare, timeout).await {
			state.cache.observe(&candidate.jid, candidate.priority, candidate.observed);
			tracing::debug!(key, bare = %bare, jid = %candidate.jid, priority = candidate.priority, "resolved by probe");
			return Some(candidate.jid);
		}

		if let Some(jid) = disco_info(&session, bare, timeout).await {
			tracing::debug!(key, bare = %bare, jid = %jid, "resolved by disco#info");
			return Some(jid);
		}

		if let Some(jid) = disco_items(&session, bare, timeout).await {
			tracing::debug!(key, bare = %bare, jid = %jid, "resolved by disco#items");
			return Some(jid);
		}

		tracing::warn!(key, bare = %bare, "no resource found, falling back to bare address");
		None
	}

	/// Subscribes the passive tracker to the session's relay once per relay.
	fn track(&self, state: &KeyState, session: &Session) {
		let relay = session.relay();
		let mut tracker = state.tracker.lock();
		if tracker
			.as_ref()
			.and_then(|t| t.relay.upgrade())
			.is_some_and(|current| Arc::ptr_eq(&current, relay))
		{
			return;
		}

		let cache = Arc::downgrade(&state.cache);
		let subscription = relay.on_raw_frame(move |element: Arc<Element>| {
			let cache = cache.clone();
			async move {
				if let (Some(cache), Frame::Presence(update)) = (cache.upgrade(), Frame::classify(&element)) {
					observe_push(&cache, &update);
				}
				Ok(())
			}
		});
		*tracker = Some(Tracker {
			relay: Arc::downgrade(relay),
			_subscription: subscription,
		});
	}
}

fn observe_push(cache: &PresenceCache, update: &PresenceUpdate) {
	if let Some(jid) = available_resource(update, None) {
		if cache.observe(&jid, update.priority, Instant::now()) {
			tracing::trace!(jid = %jid, priority = update.priority, "presence cached");
		}
	}
}

async fn probe(session: &Session, bare: &Jid, timeout: Duration) -> Option<Candidate> {
	let candidates = Arc::new(Mutex::new(Vec::new()));
	let _subscription = {
		let candidates = Arc::clone(&candidates);
		let bare = bare.bare();
		session.relay().on_raw_frame(move |element: Arc<Element>| {
			let candidates = Arc::clone(&candidates);
			let bare = bare.clone();
			async move {
				if let Frame::Presence(update) = Frame::classify(&element) {
					if let Some(jid) = available_resource(&update, Some(&bare)) {
						candidates.lock().push(Candidate {
							jid,
							priority: update.priority,
							observed: Instant::now(),
						});
					}
				}
				Ok(())
			}
		})
	};

	if let Err(e) = session.send(stanza::presence_probe(&bare.bare())) {
		tracing::debug!(bare = %bare, error = %e, "presence probe not sent");
		return None;
	}
	tokio::time::sleep(timeout).await;

	let candidates = candidates.lock();
	best_candidate(&candidates).cloned()
}

async fn disco_info(session: &Session, bare: &Jid, timeout: Duration) -> Option<Jid> {
	let request = stanza::disco_info(&bare.bare(), &session.next_id("disco-info"));
	match session.request(request, timeout).await {
		Ok(reply) => reply
			.attr("from")
			.and_then(|from| Jid::parse(from).ok())
			.filter(|from| from.is_full() && from.shares_bare(bare)),
		Err(e) => {
			tracing::debug!(bare = %bare, error = %e, "disco#info failed");
			None
		}
	}
}

async fn disco_items(session: &Session, bare: &Jid, timeout: Duration) -> Option<Jid> {
	let request = stanza::disco_items(&bare.bare(), &session.next_id("disco-items"));
	match session.request(request, timeout).await {
		Ok(reply) => reply
			.get_child("query", ns::DISCO_ITEMS)?
			.children()
			.filter(|item| item.name() == "item")
			.filter_map(|item| item.attr("jid").and_then(|jid| Jid::parse(jid).ok()))
			.find(|jid| jid.is_full() && jid.shares_bare(bare)),
		Err(e) => {
			tracing::debug!(bare = %bare, error = %e, "disco#items failed");
			None
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn jid(s: &str) -> Jid {
		Jid::parse(s).unwrap()
	}

	#[test]
	fn test_higher_priority_replaces() {
		let cache = PresenceCache::new();
		let now = Instant::now();

		assert!(cache.observe(&jid("bob@x.org/r2"), 1, now));
		assert!(cache.observe(&jid("bob@x.org/r1"), 5, now));
		assert!(!cache.observe(&jid("bob@x.org/r3"), 2, now + Duration::from_secs(1)));

		assert_eq!(cache.get(&jid("bob@x.org")), Some(jid("bob@x.org/r1")));
	}

	#[test]
	fn test_equal_priority_later_observation_wins() {
		let cache = PresenceCache::new();
		let now = Instant::now();

		cache.observe(&jid("bob@x.org/a"), 3, now);
		assert!(cache.observe(&jid("bob@x.org/b"), 3, now + Duration::from_millis(10)));
		assert_eq!(cache.get(&jid("bob@x.org")), Some(jid("bob@x.org/b")));
	}

	#[test]
	fn test_same_resource_refreshes_even_with_lower_priority() {
		let cache = PresenceCache::new();
		let now = Instant::now();

		cache.observe(&jid("bob@x.org/a"), 9, now);
		assert!(cache.observe(&jid("bob@x.org/a"), 0, now));
		assert_eq!(cache.entry(&jid("bob@x.org")).unwrap().priority, 0);
	}

	#[test]
	fn test_bare_observation_ignored() {
		let cache = PresenceCache::new();
		assert!(!cache.observe(&jid("bob@x.org"), 1, Instant::now()));
		assert!(cache.is_empty());
	}

	#[test]
	fn test_unavailable_push_keeps_entry() {
		let cache = PresenceCache::new();
		cache.observe(&jid("bob@x.org/a"), 1, Instant::now());

		let gone = Element::parse(r#"<presence xmlns="jabber:client" type="unavailable" from="bob@x.org/a"/>"#).unwrap();
		let Frame::Presence(update) = Frame::classify(&gone) else {
			panic!("not presence");
		};
		observe_push(&cache, &update);
		assert_eq!(cache.get(&jid("bob@x.org")), Some(jid("bob@x.org/a")));
	}

	#[test]
	fn test_best_candidate_ranking() {
		let now = Instant::now();
		let candidates = vec![
			Candidate {
				jid: jid("bob@x.org/r2"),
				priority: 1,
				observed: now + Duration::from_millis(5),
			},
			Candidate {
				jid: jid("bob@x.org/r1"),
				priority: 5,
				observed: now,
			},
			Candidate {
				jid: jid("bob@x.org/r3"),
				priority: 5,
				observed: now + Duration::from_millis(1),
			},
		];
		assert_eq!(best_candidate(&candidates).unwrap().jid, jid("bob@x.org/r3"));
		assert!(best_candidate(&[]).is_none());
	}

	#[test]
	fn test_available_resource_filters() {
		let parse = |xml: &str| match Frame::classify(&Element::parse(xml).unwrap()) {
			Frame::Presence(update) => update,
			other => panic!("not presence: {other:?}"),
		};
		let bare = jid("bob@x.org");

		let ok = parse(r#"<presence xmlns="jabber:client" from="bob@x.org/pc"/>"#);
		assert_eq!(available_resource(&ok, Some(&bare)), Some(jid("bob@x.org/pc")));

		let other = parse(r#"<presence xmlns="jabber:client" from="eve@x.org/pc"/>"#);
		assert_eq!(available_resource(&other, Some(&bare)), None);

		let gone = parse(r#"<presence xmlns="jabber:client" type="unavailable" from="bob@x.org/pc"/>"#);
		assert_eq!(available_resource(&gone, Some(&bare)), None);

		let bare_from = parse(r#"<presence xmlns="jabber:client" from="bob@x.org"/>"#);
		assert_eq!(available_resource(&bare_from, Some(&bare)), None);
	}
}
