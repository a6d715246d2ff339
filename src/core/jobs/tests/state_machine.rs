use crate::core::jobs::{JobStatus, can_transition, clamp_max_steps};

const TERMINAL: [JobStatus; 4] = [
    JobStatus::Completed,
    JobStatus::MaxTurnsReached,
    JobStatus::Blocked,
    JobStatus::Failed,
];

#[test]
fn pending_moves_to_running_or_failed_only() {
    assert!(can_transition(JobStatus::Pending, JobStatus::Running));
    assert!(can_transition(JobStatus::Pending, JobStatus::Failed));
    assert!(!can_transition(JobStatus::Pending, JobStatus::Completed));
    assert!(!can_transition(JobStatus::Pending, JobStatus::MaxTurnsReached));
}

#[test]
fn running_reaches_every_terminal_state() {
    for to in TERMINAL {
        assert!(
            can_transition(JobStatus::Running, to),
            "expected running -> {:?}",
            to
        );
    }
    assert!(!can_transition(JobStatus::Running, JobStatus::Pending));
}

#[test]
fn terminal_states_are_final() {
    let all = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::MaxTurnsReached,
        JobStatus::Blocked,
        JobStatus::Failed,
    ];
    for from in TERMINAL {
        for to in all {
            assert!(
                !can_transition(from, to),
                "terminal {:?} must not move to {:?}",
                from,
                to
            );
        }
    }
}

#[test]
fn status_strings_round_trip() {
    for status in [JobStatus::Pending, JobStatus::Running]
        .into_iter()
        .chain(TERMINAL)
    {
        assert_eq!(JobStatus::from_status(status.as_str()), Some(status));
    }
    assert_eq!(JobStatus::from_status("max_turns"), None);
    assert_eq!(
        serde_json::to_value(JobStatus::MaxTurnsReached).unwrap(),
        serde_json::json!("max_turns_reached")
    );
}

#[test]
fn max_steps_default_and_clamp() {
    assert_eq!(clamp_max_steps(None), 100);
    assert_eq!(clamp_max_steps(Some(1)), 3);
    assert_eq!(clamp_max_steps(Some(40)), 40);
    assert_eq!(clamp_max_steps(Some(5_000)), 100);
}
