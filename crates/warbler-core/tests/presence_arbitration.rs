//! Property check for primary-resource arbitration: after any sequence of
//! presence updates for one bare JID, the primary resource is the
//! available one with the numerically greatest priority, ties broken by
//! most recent update.

use std::collections::HashMap;

use proptest::prelude::*;

use warbler_core::{Jid, PresenceTracker, ShowState, Timestamp};

#[derive(Debug, Clone)]
struct Update {
    resource: usize,
    show: ShowState,
    priority: i8,
}

fn show_strategy() -> impl Strategy<Value = ShowState> {
    prop_oneof![
        Just(ShowState::Offline),
        Just(ShowState::Online),
        Just(ShowState::Chat),
        Just(ShowState::Away),
        Just(ShowState::Xa),
        Just(ShowState::Dnd),
    ]
}

fn update_strategy() -> impl Strategy<Value = Update> {
    (0usize..4, show_strategy(), -20i8..20).prop_map(|(resource, show, priority)| Update {
        resource,
        show,
        priority,
    })
}

/// Independent model: last state per resource, with the tracker's two
/// ingest rules (an unavailable state for an unknown resource is ignored,
/// an exact repeat does not refresh the record).
fn reference_model(updates: &[Update]) -> HashMap<&'static str, (ShowState, i8, u64)> {
    let resources = ["a", "b", "c", "d"];
    let mut model: HashMap<&'static str, (ShowState, i8, u64)> = HashMap::new();
    for (step, update) in updates.iter().enumerate() {
        let name = resources[update.resource];
        match model.get(name) {
            None if !update.show.is_available() => continue,
            Some((show, priority, _)) if *show == update.show && *priority == update.priority => {
                continue
            }
            _ => {}
        }
        model.insert(name, (update.show, update.priority, step as u64 + 1));
    }
    model
}

proptest! {
    #[test]
    fn primary_is_best_available_resource(updates in prop::collection::vec(update_strategy(), 0..40)) {
        let bare = Jid::bare("user", "example.com");
        let resources = ["a", "b", "c", "d"];
        let mut tracker = PresenceTracker::new();

        for (step, update) in updates.iter().enumerate() {
            tracker.ingest(
                &bare,
                resources[update.resource],
                update.show,
                update.priority,
                None,
                None,
                Timestamp::new(step as u64 + 1),
            );
        }

        let expected = reference_model(&updates)
            .into_iter()
            .filter(|(_, (show, _, _))| show.is_available())
            .max_by(|a, b| {
                let (_, (_, pa, ta)) = a;
                let (_, (_, pb, tb)) = b;
                pa.cmp(pb).then(ta.cmp(tb)).then(a.0.cmp(b.0))
            })
            .map(|(name, _)| name.to_owned());

        let primary = tracker.primary_resource(&bare).map(|r| r.resource.clone());
        prop_assert_eq!(primary.clone(), expected);

        // The winner, when present, is never beaten on priority by another
        // available resource
        if let Some(primary) = primary {
            let winner_priority = tracker
                .resources(&bare)
                .find(|r| r.resource == primary)
                .map(|r| r.priority)
                .unwrap();
            for record in tracker.resources(&bare).filter(|r| r.show.is_available()) {
                prop_assert!(record.priority <= winner_priority);
            }
        }
    }
}
