use preview_pool::models::session::{HandleOrigin, Session, SessionHandle, SessionStatus};

#[test]
fn new_session_starts_in_starting_status() {
    let session = Session::new("ws-1".into());

    assert_eq!(session.status, SessionStatus::Starting);
    assert!(session.endpoint_port.is_none());
    assert!(session.process_handle.is_none());
    assert!(session.cloud_task_ref.is_none());
    assert!(session.stopped_at.is_none());
    assert!(!session.session_id.is_empty());
}

#[test]
fn each_incarnation_gets_a_fresh_session_id() {
    let a = Session::new("ws-1".into());
    let b = Session::new("ws-1".into());
    assert_ne!(a.session_id, b.session_id);
}

#[test]
fn status_round_trips_through_storage_form() {
    for status in [
        SessionStatus::Starting,
        SessionStatus::Running,
        SessionStatus::Idle,
        SessionStatus::Stopping,
        SessionStatus::Stopped,
    ] {
        assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
    }
    assert_eq!(SessionStatus::parse("paused"), None);
}

#[test]
fn live_statuses_occupy_capacity() {
    assert!(SessionStatus::Starting.is_live());
    assert!(SessionStatus::Running.is_live());
    assert!(SessionStatus::Idle.is_live());
    assert!(!SessionStatus::Stopping.is_live());
    assert!(!SessionStatus::Stopped.is_live());
    assert!(SessionStatus::Stopping.is_non_stopped());
    assert!(!SessionStatus::Stopped.is_non_stopped());
}

#[test]
fn permitted_transitions() {
    use SessionStatus::{Idle, Running, Starting, Stopped, Stopping};

    assert!(Starting.can_transition_to(Running));
    assert!(Starting.can_transition_to(Stopped));
    assert!(Running.can_transition_to(Idle));
    assert!(Idle.can_transition_to(Running));
    assert!(Running.can_transition_to(Stopping));
    assert!(Idle.can_transition_to(Stopping));
    assert!(Stopping.can_transition_to(Stopped));
    assert!(Stopping.can_transition_to(Running), "failed stop reverts");
    assert!(Stopped.can_transition_to(Starting));
}

#[test]
fn rejected_transitions() {
    use SessionStatus::{Idle, Running, Starting, Stopped, Stopping};

    assert!(!Starting.can_transition_to(Stopping));
    assert!(!Starting.can_transition_to(Idle));
    assert!(!Stopped.can_transition_to(Running));
    assert!(!Stopped.can_transition_to(Stopped));
    assert!(!Running.can_transition_to(Starting));
    assert!(!Stopping.can_transition_to(Starting));
}

#[test]
fn handle_requires_an_endpoint_port() {
    let session = Session::new("ws-1".into());
    assert!(SessionHandle::from_session(&session, HandleOrigin::Started).is_none());
}

#[test]
fn handle_carries_endpoint_and_preview_url() {
    let mut session = Session::new("ws-1".into());
    session.status = SessionStatus::Running;
    session.endpoint_port = Some(4123);
    session.cloud_task_ref = Some("task-9".into());

    let handle = SessionHandle::from_session(&session, HandleOrigin::Reused).expect("handle");

    assert_eq!(handle.port, 4123);
    assert_eq!(handle.endpoint, "http://127.0.0.1:4123");
    assert_eq!(handle.preview_url, "http://localhost:4123/preview/ws-1");
    assert_eq!(handle.cloud_task_ref.as_deref(), Some("task-9"));
    assert_eq!(handle.origin, HandleOrigin::Reused);
}

#[test]
fn status_serializes_snake_case() {
    let json = serde_json::to_string(&SessionStatus::Stopping).expect("serialize");
    assert_eq!(json, "\"stopping\"");
}
