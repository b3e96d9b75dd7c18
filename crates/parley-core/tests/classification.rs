//! Conversation classification and its side effects on contacts and
//! published records.

mod common;

use common::*;
use parley_core::{ContextRecord, ContextType, Notification};
use parley_shared::{Member, MemberId, MessageBody};

fn label(kind: &str) -> String {
    format!("{kind}_{}", room().0.to_hex())
}

#[test]
fn alone_with_ourselves_stays_unknown() {
    let mut engine = engine_as(1);
    engine.open_context(room()).unwrap();

    let kind = engine.classify(room(), &[member(1)]).unwrap();
    assert_eq!(kind, ContextType::Unknown);

    let anonymous = [member(1), Member::new(MemberId(7), None)];
    assert_eq!(engine.classify(room(), &anonymous).unwrap(), ContextType::Unknown);
    assert!(engine.records().records.contains_key(&label("chat")));
}

#[test]
fn peer_join_with_default_engine_is_a_contact_chat() {
    let mut engine = engine();
    engine.transport_mut().members = vec![member(1), member(2)];

    let join = delivery(room(), 2, 0, MessageBody::Join { key: Some(key_of(2)) });
    let join_id = join.id;
    engine.deliver(join, at(0)).unwrap();

    assert_eq!(engine.context_type(&room()), Some(ContextType::Contact));
    assert_eq!(
        engine.contact(MemberId(2)).unwrap().direct_context(),
        Some(room())
    );
    assert!(engine.records().records.contains_key(&label("contact")));

    let peer = engine.contact(MemberId(2)).unwrap();
    assert_eq!(peer.key(), Some(key_of(2)));
    assert_eq!(
        engine.context(&room()).unwrap().join_of(MemberId(2)),
        Some(join_id)
    );
}

#[test]
fn one_other_identity_makes_a_contact_chat() {
    let mut engine = engine_as(1);
    engine.open_context(room()).unwrap();

    let kind = engine.classify(room(), &[member(1), member(2)]).unwrap();
    assert_eq!(kind, ContextType::Contact);
    assert_eq!(
        engine.contact(MemberId(2)).unwrap().direct_context(),
        Some(room())
    );
    assert!(!engine.is_group(&room()));

    assert!(!engine.records().records.contains_key(&label("chat")));
    let payload = &engine.records().records[&label("contact")];
    assert_eq!(
        ContextRecord::from_bytes(payload).unwrap().kind,
        ContextType::Contact
    );
}

#[test]
fn same_identity_under_two_handles_counts_once() {
    let mut engine = engine_as(1);
    engine.open_context(room()).unwrap();

    let twin = Member::new(MemberId(20), Some(key_of(2)));
    let kind = engine
        .classify(room(), &[member(1), member(2), twin])
        .unwrap();
    assert_eq!(kind, ContextType::Contact);
}

#[test]
fn two_other_identities_make_a_group() {
    let mut engine = engine_as(1);
    engine.open_context(room()).unwrap();

    let kind = engine
        .classify(room(), &[member(1), member(2), member(3)])
        .unwrap();
    assert_eq!(kind, ContextType::Group);
    assert!(engine.is_group(&room()));
    assert_eq!(engine.contact(MemberId(2)).unwrap().direct_context(), None);
}

#[test]
fn group_never_reverts() {
    let mut engine = engine_as(1);
    engine.open_context(room()).unwrap();
    engine
        .classify(room(), &[member(1), member(2), member(3)])
        .unwrap();

    assert_eq!(engine.classify(room(), &[member(1), member(2)]).unwrap(), ContextType::Group);
    assert_eq!(engine.classify(room(), &[member(1)]).unwrap(), ContextType::Group);
    assert!(engine.is_group(&room()));
}

#[test]
fn replaced_peer_promotes_to_group() {
    let mut engine = engine_as(1);
    engine.open_context(room()).unwrap();

    assert_eq!(engine.classify(room(), &[member(1), member(2)]).unwrap(), ContextType::Contact);
    assert_eq!(engine.classify(room(), &[member(1), member(3)]).unwrap(), ContextType::Group);
}

#[test]
fn scenario_a_invited_third_peer_turns_both_sides_into_groups() {
    let mut alice = engine_as(1);
    let mut bob = engine_as(2);

    for (engine, me) in [(&mut alice, 1), (&mut bob, 2)] {
        engine.transport_mut().members = vec![member(1), member(2)];
        let mut hello = delivery(room(), me, 0, MessageBody::Join { key: Some(key_of(me)) });
        hello.flags.sent = true;
        engine.deliver(hello, at(0)).unwrap();
        assert_eq!(engine.context_type(&room()), Some(ContextType::Contact));
    }
    assert_eq!(alice.contact(MemberId(2)).unwrap().direct_context(), Some(room()));
    assert_eq!(bob.contact(MemberId(1)).unwrap().direct_context(), Some(room()));

    let carol_joins = delivery(room(), 3, 10, MessageBody::Join { key: Some(key_of(3)) });
    for engine in [&mut alice, &mut bob] {
        engine.transport_mut().members = vec![member(1), member(2), member(3)];
        engine.deliver(carol_joins.clone(), at(10)).unwrap();

        assert_eq!(engine.context_type(&room()), Some(ContextType::Group));
        assert!(engine.is_group(&room()));
        assert!(engine
            .context(&room())
            .unwrap()
            .members()
            .all(|contact| contact.direct_context().is_none()));
        assert!(engine.records().records.contains_key(&label("group")));
        assert!(!engine.records().records.contains_key(&label("contact")));

        let transitions: Vec<(ContextType, ContextType)> = engine
            .drain_notifications()
            .into_iter()
            .filter_map(|note| match note {
                Notification::ContextClassified { from, to, .. } => Some((from, to)),
                _ => None,
            })
            .collect();
        assert_eq!(
            transitions,
            vec![
                (ContextType::Unknown, ContextType::Contact),
                (ContextType::Contact, ContextType::Group)
            ]
        );
    }
}

#[test]
fn metadata_changes_are_republished_under_current_label() {
    let mut engine = engine_as(1);
    engine.open_context(room()).unwrap();
    engine
        .set_context_name(room(), Some("book club".into()))
        .unwrap();
    engine
        .classify(room(), &[member(1), member(2), member(3)])
        .unwrap();
    engine
        .set_context_topic(room(), Some("chapter 4".into()))
        .unwrap();

    let record = ContextRecord::from_bytes(&engine.records().records[&label("group")]).unwrap();
    assert_eq!(
        record,
        ContextRecord {
            kind: ContextType::Group,
            name: Some("book club".into()),
            topic: Some("chapter 4".into()),
        }
    );
    assert_eq!(engine.records().records.len(), 1);
}

#[test]
fn leaving_drops_record_and_contacts() {
    let mut engine = engine_as(1);
    engine.open_context(room()).unwrap();
    engine.classify(room(), &[member(1), member(2)]).unwrap();

    assert!(engine.leave_context(&room()));
    assert!(engine.records().records.is_empty());
    assert!(engine.contact(MemberId(2)).is_none());
}
