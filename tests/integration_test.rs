use planning_poker::app::build_router;
use planning_poker::channel::ws::WsTransport;
use planning_poker::channel::PresenceTransport;
use planning_poker::config::SessionConfig;
use planning_poker::hub::{HubTransport, PresenceHub};
use planning_poker::identity::{FileStore, IdentityStore, KeyValueStore, MemoryStore};
use planning_poker::presence::flatten_snapshot;
use planning_poker::session::{SessionManager, SessionState, SessionUpdate};
use planning_poker::state::AppState;
use planning_poker::types::Role;
use std::sync::Arc;
use std::time::Duration;

fn client<S: KeyValueStore>(
    transport: Arc<dyn PresenceTransport>,
    store: S,
    name: &str,
    role: Role,
) -> SessionManager<S> {
    let mut identity = IdentityStore::new(store);
    identity.save_identity(name, role).unwrap();
    SessionManager::new(transport, identity, SessionConfig::default())
}

/// Apply queued events on every client until nobody has anything left
async fn settle(clients: &mut [&mut SessionManager<MemoryStore>]) {
    for _ in 0..100 {
        let mut quiet = true;
        for c in clients.iter_mut() {
            if !c.process_pending().await.is_empty() {
                quiet = false;
            }
        }
        if quiet {
            return;
        }
    }
    panic!("Clients did not settle");
}

/// Drive one client until `done` holds
async fn wait_until<S: KeyValueStore>(
    mgr: &mut SessionManager<S>,
    what: &str,
    done: impl Fn(&SessionManager<S>) -> bool,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !done(&*mgr) {
        match tokio::time::timeout_at(deadline, mgr.next_event()).await {
            Ok(Some(_)) => {}
            Ok(None) => panic!("Client left the session while waiting for {}", what),
            Err(_) => panic!("Timed out waiting for {}", what),
        }
    }
}

async fn admins_on_hub(hub: &PresenceHub, session_id: &str) -> Vec<String> {
    let snapshot = hub.presence_state(&format!("session:{}", session_id)).await;
    flatten_snapshot(&snapshot)
        .into_values()
        .filter(|p| p.is_admin())
        .map(|p| p.name)
        .collect()
}

#[tokio::test]
async fn test_two_admins_converge_on_newest() {
    let hub = Arc::new(PresenceHub::default());
    let transport: Arc<dyn PresenceTransport> = Arc::new(HubTransport::new(hub.clone()));

    let mut older = client(transport.clone(), MemoryStore::new(), "Olga", Role::Admin);
    let mut newer = client(transport.clone(), MemoryStore::new(), "Nina", Role::Admin);

    older.join("sprint").await;
    settle(&mut [&mut older]).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    newer.join("sprint").await;
    settle(&mut [&mut older, &mut newer]).await;

    assert_eq!(older.role(), Role::User);
    assert_eq!(older.identity().load_identity().role, Role::User);
    assert!(newer.is_admin());
    assert_eq!(admins_on_hub(&hub, "sprint").await, vec!["Nina".to_string()]);

    // Every client sees the same single admin
    for mgr in [&older, &newer] {
        let admins: Vec<_> = mgr.participants().into_iter().filter(|p| p.is_admin()).collect();
        assert_eq!(admins.len(), 1);
        assert_eq!(admins[0].name, "Nina");
    }

    let olga = older
        .participants()
        .into_iter()
        .find(|p| p.name == "Olga")
        .unwrap();
    assert_eq!(olga.vote, None);
}

#[tokio::test]
async fn test_three_admins_joining_together_leave_one() {
    let hub = Arc::new(PresenceHub::default());
    let transport: Arc<dyn PresenceTransport> = Arc::new(HubTransport::new(hub.clone()));

    let mut a = client(transport.clone(), MemoryStore::new(), "A", Role::Admin);
    let mut b = client(transport.clone(), MemoryStore::new(), "B", Role::Admin);
    let mut c = client(transport.clone(), MemoryStore::new(), "C", Role::Admin);

    // No processing in between: each sees the others only after joining
    a.join("room").await;
    b.join("room").await;
    c.join("room").await;
    settle(&mut [&mut a, &mut b, &mut c]).await;

    let admins = admins_on_hub(&hub, "room").await;
    assert_eq!(admins.len(), 1);
    let survivors = [&a, &b, &c].iter().filter(|m| m.is_admin()).count();
    assert_eq!(survivors, 1);
}

#[tokio::test]
async fn test_voting_round_and_reset() {
    let hub = Arc::new(PresenceHub::default());
    let transport: Arc<dyn PresenceTransport> = Arc::new(HubTransport::new(hub.clone()));

    let mut admin = client(transport.clone(), MemoryStore::new(), "Ada", Role::Admin);
    let mut bob = client(transport.clone(), MemoryStore::new(), "Bob", Role::User);
    let mut cleo = client(transport.clone(), MemoryStore::new(), "Cleo", Role::User);

    admin.join("planning").await;
    bob.join("planning").await;
    cleo.join("planning").await;
    settle(&mut [&mut admin, &mut bob, &mut cleo]).await;
    assert_eq!(admin.participants().len(), 3);
    assert_eq!(admin.state(), SessionState::Voting);

    bob.submit_vote(3).await;
    settle(&mut [&mut admin, &mut bob, &mut cleo]).await;
    assert!(!admin.view().show_results);

    cleo.submit_vote(8).await;
    settle(&mut [&mut admin, &mut bob, &mut cleo]).await;

    let view = admin.view();
    assert!(view.all_voted);
    assert!(view.show_results);
    assert_eq!(view.state, SessionState::Resolved);
    assert_eq!(view.overall_stats.total_votes, 2);
    assert_eq!(view.overall_stats.average, "5.50");
    assert_eq!(view.overall_stats.min_vote, 3);
    assert_eq!(view.overall_stats.max_vote, 8);
    let three = view.vote_results.iter().find(|r| r.value == 3).unwrap();
    assert_eq!(three.voters, vec!["Bob".to_string()]);

    admin.finish_voting().await;
    settle(&mut [&mut admin, &mut bob, &mut cleo]).await;
    assert!(bob.voting_finished());
    assert!(cleo.voting_finished());

    admin.reset_votes().await;
    settle(&mut [&mut admin, &mut bob, &mut cleo]).await;

    for mgr in [&admin, &bob, &cleo] {
        assert!(!mgr.voting_finished());
        assert!(!mgr.has_voted());
        assert!(mgr.participants().iter().all(|p| p.vote.is_none()));
        assert!(mgr.participants().iter().all(|p| !p.voting_finished));
        assert_eq!(mgr.state(), SessionState::Voting);
    }

    let snapshot = hub.presence_state("session:planning").await;
    assert!(flatten_snapshot(&snapshot).values().all(|p| p.vote.is_none()));
}

#[tokio::test]
async fn test_reset_straight_after_finish_reopens_everywhere() {
    let hub = Arc::new(PresenceHub::default());
    let transport: Arc<dyn PresenceTransport> = Arc::new(HubTransport::new(hub));

    let mut admin = client(transport.clone(), MemoryStore::new(), "Ada", Role::Admin);
    let mut bob = client(transport.clone(), MemoryStore::new(), "Bob", Role::User);

    admin.join("quick").await;
    bob.join("quick").await;
    settle(&mut [&mut admin, &mut bob]).await;

    // Nobody processes the finish before the reset goes out
    admin.finish_voting().await;
    admin.reset_votes().await;
    settle(&mut [&mut admin, &mut bob]).await;

    assert!(!admin.voting_finished());
    assert!(!bob.voting_finished());
    assert_eq!(admin.state(), SessionState::Voting);
    assert_eq!(bob.state(), SessionState::Voting);
}

#[tokio::test(start_paused = true)]
async fn test_nameless_client_keeps_its_session() {
    let hub = Arc::new(PresenceHub::default());
    let transport: Arc<dyn PresenceTransport> = Arc::new(HubTransport::new(hub.clone()));
    let mut anon = SessionManager::new(
        transport,
        IdentityStore::new(MemoryStore::new()),
        SessionConfig::default(),
    );

    anon.join("r").await;
    settle(&mut [&mut anon]).await;
    assert_eq!(anon.participants().len(), 1);
    assert!(!anon.expiry_pending());

    let waited = tokio::time::timeout(Duration::from_secs(3), anon.next_event()).await;
    assert!(waited.is_err(), "unexpected update {:?}", waited);
    assert!(anon.is_joined());
    assert_eq!(anon.session_id(), Some("r"));

    let names: Vec<String> = flatten_snapshot(&hub.presence_state("session:r").await)
        .into_values()
        .map(|p| p.name)
        .collect();
    assert_eq!(names, vec![anon.user_name().to_string()]);
}

#[tokio::test]
async fn test_finish_reveals_results_before_everyone_voted() {
    let hub = Arc::new(PresenceHub::default());
    let transport: Arc<dyn PresenceTransport> = Arc::new(HubTransport::new(hub));

    let mut admin = client(transport.clone(), MemoryStore::new(), "Ada", Role::Admin);
    let mut bob = client(transport.clone(), MemoryStore::new(), "Bob", Role::User);
    let mut cleo = client(transport.clone(), MemoryStore::new(), "Cleo", Role::User);

    admin.join("early").await;
    bob.join("early").await;
    cleo.join("early").await;
    bob.submit_vote(13).await;
    settle(&mut [&mut admin, &mut bob, &mut cleo]).await;
    assert!(!cleo.view().show_results);

    admin.finish_voting().await;
    settle(&mut [&mut admin, &mut bob, &mut cleo]).await;

    let view = cleo.view();
    assert!(!view.all_voted);
    assert!(view.show_results);
    assert_eq!(view.overall_stats.total_votes, 1);

    // A late vote doesn't hide the results again
    cleo.submit_vote(1).await;
    settle(&mut [&mut admin, &mut bob, &mut cleo]).await;
    assert!(bob.view().show_results);
}

#[tokio::test]
async fn test_leave_and_rejoin() {
    let hub = Arc::new(PresenceHub::default());
    let transport: Arc<dyn PresenceTransport> = Arc::new(HubTransport::new(hub.clone()));

    let mut admin = client(transport.clone(), MemoryStore::new(), "Ada", Role::Admin);
    let mut bob = client(transport.clone(), MemoryStore::new(), "Bob", Role::User);

    admin.join("daily").await;
    bob.join("daily").await;
    settle(&mut [&mut admin, &mut bob]).await;
    let bob_id = bob.user_id().unwrap().to_string();

    bob.leave().await;
    settle(&mut [&mut admin, &mut bob]).await;
    assert_eq!(admin.participants().len(), 1);
    assert_eq!(bob.session_id(), Some("daily"));
    assert_eq!(hub.subscriber_count("session:daily").await, 1);

    // Same id after rejoining
    bob.join("daily").await;
    settle(&mut [&mut admin, &mut bob]).await;
    assert_eq!(admin.participants().len(), 2);
    assert_eq!(bob.user_id(), Some(bob_id.as_str()));

    admin.logout().await;
    bob.expire_session().await;
    assert_eq!(hub.topic_count().await, 0);
}

#[tokio::test]
async fn test_switching_sessions_releases_previous() {
    let hub = Arc::new(PresenceHub::default());
    let transport: Arc<dyn PresenceTransport> = Arc::new(HubTransport::new(hub.clone()));

    let mut bob = client(transport, MemoryStore::new(), "Bob", Role::User);
    bob.join("first").await;
    bob.join("second").await;

    assert_eq!(hub.subscriber_count("session:first").await, 0);
    assert_eq!(hub.subscriber_count("session:second").await, 1);
    assert_eq!(bob.session_id(), Some("second"));
}

#[tokio::test]
async fn test_demotion_is_persisted_to_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("identity.json");

    let hub = Arc::new(PresenceHub::default());
    let transport: Arc<dyn PresenceTransport> = Arc::new(HubTransport::new(hub));

    let mut older = client(
        transport.clone(),
        FileStore::open(&path).unwrap(),
        "Olga",
        Role::Admin,
    );
    older.join("persist").await;
    while !older.process_pending().await.is_empty() {}

    tokio::time::sleep(Duration::from_millis(5)).await;
    let mut newer = client(transport, MemoryStore::new(), "Nina", Role::Admin);
    newer.join("persist").await;

    wait_until(&mut older, "demotion", |m| m.role() == Role::User).await;

    let reopened = IdentityStore::new(FileStore::open(&path).unwrap());
    let loaded = reopened.load_identity();
    assert_eq!(loaded.name, "Olga");
    assert_eq!(loaded.role, Role::User);
    assert_eq!(loaded.id.as_deref(), older.user_id());
}

async fn spawn_relay() -> (String, Arc<AppState>) {
    let state = Arc::new(AppState::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("ws://{}/ws", addr), state)
}

#[tokio::test]
async fn test_session_over_websocket_relay() {
    let (url, relay) = spawn_relay().await;
    let transport: Arc<dyn PresenceTransport> = Arc::new(WsTransport::new(url));

    let mut admin = client(transport.clone(), MemoryStore::new(), "Ada", Role::Admin);
    let mut bob = client(transport.clone(), MemoryStore::new(), "Bob", Role::User);

    admin.join("remote").await;
    bob.join("remote").await;
    assert!(admin.is_joined());
    assert!(bob.is_joined());

    wait_until(&mut admin, "both participants", |m| m.participants().len() == 2).await;
    wait_until(&mut bob, "both participants", |m| m.participants().len() == 2).await;

    bob.submit_vote(5).await;
    wait_until(&mut admin, "bob's vote", |m| m.view().all_voted).await;
    assert_eq!(admin.view().overall_stats.average, "5.00");

    admin.finish_voting().await;
    wait_until(&mut bob, "finish", |m| m.voting_finished()).await;

    admin.reset_votes().await;
    wait_until(&mut bob, "reset", |m| {
        !m.voting_finished() && m.participants().iter().all(|p| p.vote.is_none())
    })
    .await;
    assert!(!bob.has_voted());
    wait_until(&mut admin, "bob's cleared vote", |m| {
        m.participants().iter().all(|p| p.vote.is_none())
    })
    .await;

    bob.leave().await;
    wait_until(&mut admin, "bob leaving", |m| m.participants().len() == 1).await;

    admin.leave().await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while relay.hub.topic_count().await > 0 {
        assert!(tokio::time::Instant::now() < deadline, "relay kept the topic");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_relay_demotes_over_websocket() {
    let (url, _relay) = spawn_relay().await;
    let transport: Arc<dyn PresenceTransport> = Arc::new(WsTransport::new(url));

    let mut older = client(transport.clone(), MemoryStore::new(), "Olga", Role::Admin);
    older.join("remote-admins").await;
    wait_until(&mut older, "own presence", |m| m.participants().len() == 1).await;

    tokio::time::sleep(Duration::from_millis(5)).await;
    let mut newer = client(transport, MemoryStore::new(), "Nina", Role::Admin);
    newer.join("remote-admins").await;

    wait_until(&mut older, "demotion", |m| m.role() == Role::User).await;
    wait_until(&mut newer, "older admin stepping down", |m| {
        m.participants().iter().filter(|p| p.is_admin()).count() == 1
            && m.participants().len() == 2
    })
    .await;
    assert!(newer.is_admin());
}

#[tokio::test]
async fn test_subscribe_failure_leaves_client_detached() {
    let transport: Arc<dyn PresenceTransport> = Arc::new(WsTransport::new("ws://127.0.0.1:9/ws"));
    let mut bob = client(transport, MemoryStore::new(), "Bob", Role::User);

    bob.join("nowhere").await;
    assert!(!bob.is_joined());
    assert_eq!(bob.session_id(), Some("nowhere"));

    bob.submit_vote(3).await;
    assert!(!bob.has_voted());
    assert_eq!(bob.next_event().await, None::<SessionUpdate>);
}
