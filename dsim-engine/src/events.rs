//! Event triggers fired around message sends and receives.
//!
//! Two tables share one key: (triggering process, trigger point, round,
//! message type, process at the other end of the channel).
//!
//! * **Base-algorithm events** hold pre-declared message sets. A match sends
//!   each template, letting a reference protocol run next to the algorithm
//!   under test. `Algorithm::build_message` may enrich each template before it
//!   is sent.
//! * **Internal events** hold callback names. A match invokes
//!   `Algorithm::internal_event`.
//!
//! Anything a trigger sends goes through the no-events path, so triggers never
//! fire from their own traffic.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
};

use dsim_common::{FieldValue, Message, MessageType, ProcessId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerPoint {
    BeforeSend,
    AfterSend,
    BeforeReceive,
    AfterReceive,
}

impl fmt::Display for TriggerPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BeforeSend => "BeforeSendMessage",
            Self::AfterSend => "AfterSendMessage",
            Self::BeforeReceive => "BeforeReceiveMessage",
            Self::AfterReceive => "AfterReceiveMessage",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub process: ProcessId,
    pub point: TriggerPoint,
    pub round: i64,
    pub message_type: MessageType,
    pub other_end: ProcessId,
}

/// Policy used to resolve a set of target processes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TargetSelection {
    /// Every outgoing neighbour.
    #[default]
    All,
    /// Only the listed neighbours.
    Include(Vec<ProcessId>),
    /// Every neighbour except the listed ones.
    Exclude(Vec<ProcessId>),
}

impl TargetSelection {
    /// Resolves against the outgoing neighbours of `me`.
    ///
    /// The result is sorted, has no duplicates and never contains `me`. Ids in
    /// an `Include` list that are not neighbours are left out.
    #[must_use]
    pub fn resolve(&self, neighbours: &[ProcessId], me: ProcessId) -> Vec<ProcessId> {
        let candidates: BTreeSet<ProcessId> =
            neighbours.iter().copied().filter(|&p| p != me).collect();
        match self {
            Self::All => candidates.into_iter().collect(),
            Self::Include(ids) => candidates
                .into_iter()
                .filter(|p| ids.contains(p))
                .collect(),
            Self::Exclude(ids) => candidates
                .into_iter()
                .filter(|p| !ids.contains(p))
                .collect(),
        }
    }
}

/// A message template declared in the base-algorithm table.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggeredMessage {
    pub message_type: MessageType,
    pub name: String,
    pub fields: BTreeMap<String, FieldValue>,
    /// Round stamped on the message; `None` uses the sender's current round.
    pub round: Option<i64>,
    pub targets: TargetSelection,
}

impl TriggeredMessage {
    #[must_use]
    pub fn new(message_type: MessageType, targets: TargetSelection) -> Self {
        Self {
            name: message_type.name().to_owned(),
            message_type,
            fields: BTreeMap::new(),
            round: None,
            targets,
        }
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_round(mut self, round: i64) -> Self {
        self.round = Some(round);
        self
    }

    /// Default construction used when the algorithm does not override
    /// `build_message`.
    #[must_use]
    pub fn instantiate(&self, current_round: i64) -> Message {
        let mut message = Message::new(self.message_type.clone())
            .with_name(self.name.clone())
            .with_round(self.round.unwrap_or(current_round));
        message.fields = self.fields.clone();
        message
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventTables {
    base: HashMap<EventKey, Vec<TriggeredMessage>>,
    internal: HashMap<EventKey, Vec<String>>,
}

impl EventTables {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_base_event(&mut self, key: EventKey, message: TriggeredMessage) {
        self.base.entry(key).or_default().push(message);
    }

    pub fn add_internal_event(&mut self, key: EventKey, callback: impl Into<String>) {
        self.internal.entry(key).or_default().push(callback.into());
    }

    #[must_use]
    pub fn base_events(&self, key: &EventKey) -> &[TriggeredMessage] {
        self.base.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    #[must_use]
    pub fn internal_events(&self, key: &EventKey) -> &[String] {
        self.internal.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// True when nothing in either table belongs to `process`.
    #[must_use]
    pub fn is_idle_for(&self, process: ProcessId) -> bool {
        !self.base.keys().any(|k| k.process == process)
            && !self.internal.keys().any(|k| k.process == process)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.base.is_empty() && self.internal.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(point: TriggerPoint) -> EventKey {
        EventKey {
            process: 1,
            point,
            round: 0,
            message_type: MessageType::Forwarded,
            other_end: 2,
        }
    }

    #[test]
    fn test_target_selection_never_includes_self() {
        let neighbours = [3, 1, 2, 1, 0];
        assert_eq!(TargetSelection::All.resolve(&neighbours, 1), vec![0, 2, 3]);
        assert_eq!(
            TargetSelection::Include(vec![1, 3, 9]).resolve(&neighbours, 1),
            vec![3]
        );
        assert_eq!(
            TargetSelection::Exclude(vec![2]).resolve(&neighbours, 1),
            vec![0, 3]
        );
    }

    #[test]
    fn test_lookup_is_exact_on_every_key_part() {
        let mut tables = EventTables::new();
        tables.add_base_event(
            key(TriggerPoint::AfterReceive),
            TriggeredMessage::new(MessageType::Backward, TargetSelection::All),
        );
        tables.add_internal_event(key(TriggerPoint::BeforeSend), "count");

        assert_eq!(tables.base_events(&key(TriggerPoint::AfterReceive)).len(), 1);
        assert!(tables.base_events(&key(TriggerPoint::BeforeReceive)).is_empty());
        assert_eq!(tables.internal_events(&key(TriggerPoint::BeforeSend)), ["count"]);

        let mut other_round = key(TriggerPoint::AfterReceive);
        other_round.round = 1;
        assert!(tables.base_events(&other_round).is_empty());

        assert!(!tables.is_idle_for(1));
        assert!(tables.is_idle_for(2));
    }

    #[test]
    fn test_template_instantiation_uses_current_round_by_default() {
        let template = TriggeredMessage::new(MessageType::Backward, TargetSelection::All)
            .with_field("probe", true);
        let message = template.instantiate(4);
        assert_eq!(message.round(), Some(4));
        assert_eq!(message.field("probe"), Some(&FieldValue::Bool(true)));

        let fixed = template.with_round(9).instantiate(4);
        assert_eq!(fixed.round(), Some(9));
    }
}
