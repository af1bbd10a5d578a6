//! Merge-law tests for the node registry: partial merges accumulate, never
//! clear, and statistics count exactly what arrived.

use chrono::Utc;
use meshwatch::event::MeshEvent;
use meshwatch::nodedb::NodeDb;

fn event(raw: &str) -> MeshEvent {
    MeshEvent::decode(raw.as_bytes()).expect("test event decodes")
}

#[test]
fn nodeinfo_sets_names_and_touches_no_other_record() {
    let mut db = NodeDb::default();
    let now = Utc::now();
    db.apply_event(
        &event(r#"{"type":"text","from":200,"payload":{"text":"bystander"}}"#),
        now,
    )
    .unwrap();
    let bystander_before = db.nodes[&200].clone();

    db.apply_event(
        &event(
            r#"{"type":"nodeinfo","from":100,"payload":
               {"hardware":9,"shortname":"AA11","longname":"Alpha Node"}}"#,
        ),
        now,
    )
    .unwrap();

    let rec = &db.nodes[&100];
    assert_eq!(rec.shortname.as_deref(), Some("AA11"));
    assert_eq!(rec.longname.as_deref(), Some("Alpha Node"));
    assert_eq!(rec.hardware.as_deref(), Some("9"));
    assert_eq!(db.nodes[&200], bystander_before);
}

#[test]
fn different_kinds_accumulate_into_one_record() {
    let mut db = NodeDb::default();
    let now = Utc::now();
    db.apply_event(
        &event(
            r#"{"type":"nodeinfo","from":1,"payload":
               {"hardware":"TBEAM","shortname":"B1","longname":"Beam One"}}"#,
        ),
        now,
    )
    .unwrap();
    db.apply_event(
        &event(
            r#"{"type":"position","from":1,"payload":
               {"latitude_i":514951900,"longitude_i":-1255000,"altitude":30}}"#,
        ),
        now,
    )
    .unwrap();
    db.apply_event(
        &event(
            r#"{"type":"telemetry","from":1,"payload":
               {"air_util_tx":1.5,"battery_level":100,"channel_utilization":4.0,"voltage":4.15}}"#,
        ),
        now,
    )
    .unwrap();

    // The record holds the union: no kind's update cleared another kind's fields.
    let rec = &db.nodes[&1];
    assert_eq!(rec.shortname.as_deref(), Some("B1"));
    let pos = rec.position.as_ref().expect("position kept");
    assert_eq!(pos.lat, 51.49519);
    assert_eq!(pos.alt, 30);
    let tel = rec.telemetry.as_ref().expect("telemetry kept");
    assert_eq!(tel.batt, 100);
    assert_eq!(rec.message_type_stats.len(), 3);
}

#[test]
fn counts_equal_events_seen_per_kind() {
    let mut db = NodeDb::default();
    let now = Utc::now();
    for _ in 0..5 {
        db.apply_event(
            &event(
                r#"{"type":"telemetry","from":3,"payload":
                   {"air_util_tx":1.0,"battery_level":90,"channel_utilization":2.0,"voltage":3.8}}"#,
            ),
            now,
        )
        .unwrap();
    }
    for _ in 0..2 {
        db.apply_event(&event(r#"{"type":"text","from":3,"payload":{"text":"hi"}}"#), now)
            .unwrap();
    }
    let rec = &db.nodes[&3];
    assert_eq!(rec.message_type_stats["telemetry"].count, 5);
    assert_eq!(rec.message_type_stats["text"].count, 2);
}

#[test]
fn signal_fields_track_the_latest_event() {
    let mut db = NodeDb::default();
    let now = Utc::now();
    db.apply_event(
        &event(r#"{"type":"text","from":8,"rssi":-70,"snr":9.5,"hops_away":1,"payload":{"text":"a"}}"#),
        now,
    )
    .unwrap();
    // Next event omits the signal fields: the publishing node was the sender.
    db.apply_event(&event(r#"{"type":"text","from":8,"payload":{"text":"b"}}"#), now)
        .unwrap();
    let rec = &db.nodes[&8];
    assert_eq!(rec.latest_rssi, 0);
    assert_eq!(rec.latest_snr, 0.0);
    assert_eq!(rec.latest_hops, -1);
    assert_eq!(rec.message_type_stats["text"].count, 2);
}

#[test]
fn unknown_kinds_are_counted_but_merge_nothing_else() {
    let mut db = NodeDb::default();
    db.apply_event(
        &event(r#"{"type":"neighborinfo","from":4,"payload":{"whatever":1}}"#),
        Utc::now(),
    )
    .unwrap();
    let rec = &db.nodes[&4];
    assert_eq!(rec.message_type_stats["neighborinfo"].count, 1);
    assert!(rec.shortname.is_none());
    assert!(rec.position.is_none());
    assert!(rec.telemetry.is_none());
}
