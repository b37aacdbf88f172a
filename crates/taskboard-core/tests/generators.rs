#![allow(dead_code)]

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use taskboard_core::{Priority, Status, Task};

pub fn arb_status() -> impl Strategy<Value = Status> + Clone {
    prop::sample::select(Status::ALL.to_vec())
}

pub fn arb_priority() -> impl Strategy<Value = Priority> + Clone {
    prop_oneof![
        Just(Priority::Low),
        Just(Priority::Medium),
        Just(Priority::High),
        Just(Priority::Urgent),
    ]
}

pub fn arb_task() -> impl Strategy<Value = Task> + Clone {
    (
        "[a-z0-9]{1,8}",
        "[A-Za-z ]{1,24}",
        arb_status(),
        arb_priority(),
        prop::collection::btree_set("[a-z]{1,6}", 0..4),
        prop::option::of("u[0-9]{1,3}"),
        0i64..10_000,
    )
        .prop_map(|(id, title, status, priority, labels, assignee_id, age_mins)| {
            let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
            let mut task = Task::new(id, title, base - Duration::minutes(age_mins));
            task.status = status;
            task.priority = priority;
            task.labels = labels;
            task.assignee_id = assignee_id;
            task
        })
}
