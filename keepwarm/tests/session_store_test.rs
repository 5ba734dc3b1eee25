use std::fs;

use keepwarm::session::{Cookie, OriginState, StorageEntry, WORKSTATION_TOKEN_COOKIE};
use keepwarm::{RunLog, SessionState, SessionStore};

fn assert_healed(store: &SessionStore) {
    let raw = fs::read_to_string(store.path()).unwrap();
    let state = SessionState::parse(&raw).expect("file is valid after loading");
    assert!(state.is_empty());
}

#[test]
fn missing_file_is_created_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path().join("cookie.json"));
    let mut log = RunLog::new();

    assert_eq!(store.load(&mut log), SessionState::empty());
    assert_healed(&store);
    assert!(log.contains("does not exist"));
}

#[test]
fn unusable_content_is_replaced() {
    for raw in ["", "not json", r#"{"bad":"data"}"#, r#"{"cookies":"x"}"#, "[1,2]"] {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("cookie.json"));
        fs::write(store.path(), raw).unwrap();

        let mut log = RunLog::new();
        assert_eq!(store.load(&mut log), SessionState::empty(), "{raw:?}");
        assert_healed(&store);
    }
}

#[test]
fn saved_state_loads_back() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path().join("nested").join("cookie.json"));
    let state = SessionState {
        cookies: vec![Cookie::new(
            WORKSTATION_TOKEN_COOKIE,
            "h.p.s",
            ".cloudworkstations.dev",
        )],
        origins: vec![OriginState {
            origin: "https://idx.google.com".to_string(),
            local_storage: vec![StorageEntry {
                name: "theme".to_string(),
                value: "dark".to_string(),
            }],
        }],
    };

    store.save(&state).unwrap();
    let mut log = RunLog::new();
    assert_eq!(store.load(&mut log), state);
    assert_eq!(store.read_existing().unwrap().workstation_token(), Some("h.p.s"));

    let raw = fs::read_to_string(store.path()).unwrap();
    assert!(raw.contains("\"localStorage\""));
    assert!(!dir.path().join("nested").join("cookie.json.tmp").exists());
}

#[test]
fn read_existing_never_repairs() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path().join("cookie.json"));
    fs::write(store.path(), r#"{"bad":"data"}"#).unwrap();

    assert!(store.read_existing().is_none());
    assert_eq!(
        fs::read_to_string(store.path()).unwrap(),
        r#"{"bad":"data"}"#
    );
}

#[test]
fn one_bad_cookie_does_not_wipe_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path().join("cookie.json"));
    let raw = format!(
        r#"{{"cookies":[{{"name":42}},{{"name":"{WORKSTATION_TOKEN_COOKIE}","value":"h.p.s","domain":".cloudworkstations.dev"}}],"origins":[]}}"#
    );
    fs::write(store.path(), &raw).unwrap();

    let mut log = RunLog::new();
    let state = store.load(&mut log);
    assert_eq!(state.workstation_token(), Some("h.p.s"));
    assert_eq!(state.cookies.len(), 1);
    assert!(!log.contains("resetting it"));
    assert_eq!(fs::read_to_string(store.path()).unwrap(), raw);
}
