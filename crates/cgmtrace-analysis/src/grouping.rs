use cgmtrace_ingest_core::EventRecord;
use std::collections::HashMap;

/// Events partitioned by a correlation key.
///
/// Keys keep the order in which they were first seen and each group keeps
/// the input order of its events. Nothing is re-sorted.
#[derive(Debug, Clone, Default)]
pub struct KeyedGroups<'a> {
    order: Vec<&'a str>,
    groups: HashMap<&'a str, Vec<&'a EventRecord>>,
}

impl<'a> KeyedGroups<'a> {
    fn build<I, F>(events: I, key_of: F) -> Self
    where
        I: IntoIterator<Item = &'a EventRecord>,
        F: Fn(&'a EventRecord) -> Option<&'a str>,
    {
        let mut order = Vec::new();
        let mut groups: HashMap<&'a str, Vec<&'a EventRecord>> = HashMap::new();
        for event in events {
            let Some(key) = key_of(event) else {
                continue;
            };
            groups
                .entry(key)
                .or_insert_with(|| {
                    order.push(key);
                    Vec::new()
                })
                .push(event);
        }
        Self { order, groups }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &'a str> + '_ {
        self.order.iter().copied()
    }

    pub fn get(&self, key: &str) -> Option<&[&'a EventRecord]> {
        self.groups.get(key).map(Vec::as_slice)
    }

    /// Groups in first-seen key order.
    pub fn iter(&self) -> impl Iterator<Item = (&'a str, &[&'a EventRecord])> + '_ {
        self.order
            .iter()
            .filter_map(|key| self.groups.get(key).map(|group| (*key, group.as_slice())))
    }
}

pub fn group_by_session(events: &[EventRecord]) -> KeyedGroups<'_> {
    KeyedGroups::build(events, |event| event.session_key.as_deref())
}

pub fn group_by_request(events: &[EventRecord]) -> KeyedGroups<'_> {
    KeyedGroups::build(events, |event| event.request_key.as_deref())
}

/// Splits an already grouped sub-list by attempt key.
pub fn group_by_attempt<'a>(events: &[&'a EventRecord]) -> KeyedGroups<'a> {
    KeyedGroups::build(events.iter().copied(), |event| event.attempt_key.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: u64, ts: i64, session: Option<&str>, request: Option<&str>) -> EventRecord {
        let mut record = EventRecord::new(id, ts, 2, format!("E{id}"));
        record.session_key = session.map(str::to_string);
        record.request_key = request.map(str::to_string);
        record
    }

    #[test]
    fn sessions_keep_first_seen_order_and_input_order() {
        let events = vec![
            event(1, 10, Some("b"), None),
            event(2, 11, Some("a"), None),
            event(3, 12, None, None),
            event(4, 13, Some("b"), None),
        ];
        let groups = group_by_session(&events);
        assert_eq!(groups.keys().collect::<Vec<_>>(), vec!["b", "a"]);
        let ids: Vec<u64> = groups
            .get("b")
            .expect("b")
            .iter()
            .map(|e| e.record_id)
            .collect();
        assert_eq!(ids, vec![1, 4]);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn request_and_attempt_groups_skip_missing_keys() {
        let mut events = vec![
            event(1, 1, Some("s"), Some("r1")),
            event(2, 2, Some("s"), Some("r1")),
            event(3, 3, Some("s"), None),
        ];
        events[0].attempt_key = Some("a1".into());
        events[1].attempt_key = Some("a2".into());

        let requests = group_by_request(&events);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests.get("r1").map(<[_]>::len), Some(2));

        let session = group_by_session(&events);
        let attempts = group_by_attempt(session.get("s").expect("s"));
        assert_eq!(attempts.keys().collect::<Vec<_>>(), vec!["a1", "a2"]);
    }

    #[test]
    fn empty_input_yields_empty_groups() {
        assert!(group_by_session(&[]).is_empty());
        assert_eq!(group_by_request(&[]).iter().count(), 0);
    }
}
