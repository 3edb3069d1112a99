//! Full socket-based integration tests for client ↔ server communication.

use std::time::Duration;

use dist_client::NetClient;
use dist_server::server::{bind_ephemeral, ObjectServer, ServerEvent};
use dist_shared::config::ServerConfig;
use dist_shared::net::{decode_from_bytes, encode_to_bytes, NetMsg, ReliableConn, TickPayload};
use dist_shared::schema::{
    ClassSchema, ClientId, FieldDef, FieldValue, SchemaRegistry, ZoneId,
};
use dist_tests::{init_logging, pump};

fn test_schema() -> SchemaRegistry {
    let mut registry = SchemaRegistry::new();
    registry.register(ClassSchema::new(
        1,
        "Avatar",
        vec![
            FieldDef::new("x", FieldValue::Float(0.0)),
            FieldDef::new("hp", FieldValue::Uint(100)),
        ],
    ))
    .unwrap();
    registry
}

fn test_config() -> ServerConfig {
    ServerConfig {
        password: "x".to_string(),
        tick_rate: 60,
        ..Default::default()
    }
}

/// Connects a client while concurrently stepping the server, since the
/// handshake reply only goes out during a tick.
async fn connect(
    server: &mut ObjectServer,
    password: &str,
) -> anyhow::Result<NetClient> {
    let addr = server.local_addr();
    let (client, _) = tokio::join!(
        NetClient::connect(addr, test_schema(), password, 60, 30),
        pump(server, 25)
    );
    client
}

/// Unit-style test: protocol messages roundtrip correctly.
#[test]
fn protocol_messages_roundtrip() -> anyhow::Result<()> {
    let hello = NetMsg::Hello {
        password: "x".to_string(),
        schema_hash: 1234,
        update_rate: 20,
        cmd_rate: 30,
    };
    assert_eq!(decode_from_bytes(&encode_to_bytes(&hello)?)?, hello);

    let resp = NetMsg::HelloResp {
        ok: true,
        reason: None,
        client_id: Some(ClientId(1)),
        tick_rate: Some(60),
    };
    assert_eq!(decode_from_bytes(&encode_to_bytes(&resp)?)?, resp);

    Ok(())
}

/// Correct hello gets verified: first client id is 1 and the configured tick
/// rate comes back.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hello_handshake_verifies_client() -> anyhow::Result<()> {
    init_logging();
    let (mut server, _) = bind_ephemeral(test_config(), test_schema()).await?;

    let client = connect(&mut server, "x").await?;
    assert_eq!(client.client_id, ClientId(1));
    assert_eq!(client.tick_rate, 60);
    assert_eq!(server.client_count(), 1);
    assert_eq!(
        server.drain_events(),
        vec![ServerEvent::ClientConnected(ClientId(1))]
    );
    Ok(())
}

/// Wrong password is terminal: explicit rejection, then the connection is
/// closed. The server keeps running.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bad_password_is_rejected() -> anyhow::Result<()> {
    init_logging();
    let (mut server, _) = bind_ephemeral(test_config(), test_schema()).await?;

    let err = connect(&mut server, "wrong").await.unwrap_err();
    assert!(err.to_string().contains("refused"), "got: {err}");

    pump(&mut server, 2).await?;
    assert_eq!(server.client_count(), 0);

    // A correct hello on a fresh connection still works.
    let client = connect(&mut server, "x").await?;
    assert_eq!(client.client_id, ClientId(1));
    Ok(())
}

/// With an object already live in zone 100, a SetInterest for that zone
/// delivers the object's generate before the interest-complete
/// acknowledgment.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn generate_precedes_interest_complete() -> anyhow::Result<()> {
    init_logging();
    let (mut server, _) = bind_ephemeral(test_config(), test_schema()).await?;
    let do_id = server.generate_object(1, ZoneId(100), None, None).await?;
    assert_eq!(do_id.0, 1);

    let mut client = connect(&mut server, "x").await?;
    client.set_interest(5, vec![ZoneId(100)]).await?;
    pump(&mut server, 5).await?;

    let mut saw_generate = false;
    loop {
        let msg = client
            .poll(Duration::from_millis(200))
            .await?
            .expect("expected interest-complete before the stream went quiet");
        match msg {
            NetMsg::GenerateObject { entries } => {
                assert!(
                    !client.interest_complete(5),
                    "generate must arrive before interest complete"
                );
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].do_id, do_id);
                assert_eq!(entries[0].zone_id, ZoneId(100));
                saw_generate = true;
            }
            NetMsg::InterestComplete { handle } => {
                assert_eq!(handle, 5);
                assert!(saw_generate, "interest complete arrived without generate");
                break;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Repeating an interest request that matches the current computed set
/// produces no generate/delete traffic, only the completion ack.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_interest_is_idempotent() -> anyhow::Result<()> {
    init_logging();
    let (mut server, _) = bind_ephemeral(test_config(), test_schema()).await?;
    server.generate_object(1, ZoneId(100), None, None).await?;

    let mut client = connect(&mut server, "x").await?;
    client.set_interest(1, vec![ZoneId(100)]).await?;
    pump(&mut server, 3).await?;
    while !client.interest_complete(1) {
        client.poll(Duration::from_millis(200)).await?;
    }

    // Same zones again: no generates or deletes may appear before the ack.
    client.set_interest(2, vec![ZoneId(100)]).await?;
    pump(&mut server, 3).await?;
    loop {
        let msg = client
            .poll(Duration::from_millis(200))
            .await?
            .expect("expected second interest complete");
        match msg {
            NetMsg::GenerateObject { .. }
            | NetMsg::GenerateOwnerObject { .. }
            | NetMsg::DeleteObject { .. } => {
                panic!("idempotent interest change generated traffic: {msg:?}")
            }
            NetMsg::InterestComplete { handle: 2 } => break,
            _ => {}
        }
    }
    Ok(())
}

/// Add/remove interest requests adjust the explicit set incrementally, and
/// rate changes are accepted in the verified state.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn add_and_remove_interest_round_trip() -> anyhow::Result<()> {
    init_logging();
    let (mut server, _) = bind_ephemeral(test_config(), test_schema()).await?;
    let do_id = server.generate_object(1, ZoneId(100), None, None).await?;

    let mut client = connect(&mut server, "x").await?;
    client.set_update_rate(30).await?;
    client.set_cmd_rate(20).await?;
    client.add_interest(1, vec![ZoneId(100)]).await?;
    pump(&mut server, 3).await?;
    while !client.interest_complete(1) {
        client.poll(Duration::from_millis(200)).await?.expect("add traffic");
    }
    assert!(client.objects().contains_key(&do_id));

    client.remove_interest(2, vec![ZoneId(100)]).await?;
    pump(&mut server, 3).await?;
    while !client.interest_complete(2) {
        client.poll(Duration::from_millis(200)).await?.expect("remove traffic");
    }
    assert!(!client.objects().contains_key(&do_id));
    Ok(())
}

/// Two clients in the same zone. The client that acknowledged a baseline
/// gets a delta carrying only the changed field; the client that never
/// acknowledged gets full snapshots.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delta_for_acked_client_full_for_silent_client() -> anyhow::Result<()> {
    init_logging();
    let (mut server, _) = bind_ephemeral(test_config(), test_schema()).await?;
    let do_id = server
        .generate_object(
            1,
            ZoneId(100),
            None,
            Some(vec![FieldValue::Float(1.0), FieldValue::Uint(100)]),
        )
        .await?;

    let mut alice = connect(&mut server, "x").await?;
    let mut bob = connect(&mut server, "x").await?;
    alice.set_interest(1, vec![ZoneId(100)]).await?;
    bob.set_interest(1, vec![ZoneId(100)]).await?;
    pump(&mut server, 5).await?;

    // Drain until both have applied a snapshot containing the object.
    while alice.last_tick().is_none() || !alice.objects().contains_key(&do_id) {
        alice.poll(Duration::from_millis(200)).await?.expect("alice traffic");
    }
    while bob.last_tick().is_none() || !bob.objects().contains_key(&do_id) {
        bob.poll(Duration::from_millis(200)).await?.expect("bob traffic");
    }

    // Only alice acknowledges her baseline.
    alice.send_ack().await?;
    let baseline = alice.last_tick().unwrap();
    pump(&mut server, 2).await?;

    // Change one field, then run a tick.
    server
        .directory_mut()
        .get_mut(do_id)
        .unwrap()
        .fields[0] = FieldValue::Float(2.0);
    pump(&mut server, 2).await?;

    // Alice: the next delta carrying the object lists only field 0.
    loop {
        let msg = alice.poll(Duration::from_millis(200)).await?.expect("alice delta");
        if let NetMsg::Tick(TickPayload::Delta {
            baseline_tick,
            objects,
            ..
        }) = msg
        {
            if objects.is_empty() {
                continue; // tick before the field change
            }
            assert!(baseline_tick >= baseline);
            assert_eq!(objects.len(), 1);
            assert_eq!(objects[0].do_id, do_id);
            let indices: Vec<u8> = objects[0].fields.iter().map(|(i, _)| *i).collect();
            assert_eq!(indices, vec![0], "delta must carry only the changed field");
            break;
        }
    }
    assert_eq!(
        alice.object_field(do_id, "x")?,
        FieldValue::Float(2.0),
        "reconstructed state must match the live object"
    );

    // Bob never acked: everything he gets is a full snapshot.
    loop {
        let msg = bob.poll(Duration::from_millis(200)).await?.expect("bob full");
        match msg {
            NetMsg::Tick(TickPayload::Delta { .. }) => {
                panic!("silent client must never receive deltas")
            }
            NetMsg::Tick(TickPayload::Full { objects, .. }) => {
                if let Some(obj) = objects.iter().find(|o| o.do_id == do_id) {
                    assert_eq!(obj.state.fields.len(), 2, "full carries every field");
                    if bob.object_field(do_id, "x")? == FieldValue::Float(2.0) {
                        break;
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Once the acknowledged baseline ages out of the bounded frame history, the
/// server falls back to full snapshots.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_baseline_falls_back_to_full() -> anyhow::Result<()> {
    init_logging();
    let cfg = ServerConfig {
        history_depth: 4,
        ..test_config()
    };
    let (mut server, _) = bind_ephemeral(cfg, test_schema()).await?;
    let do_id = server.generate_object(1, ZoneId(100), None, None).await?;

    let mut client = connect(&mut server, "x").await?;
    client.set_interest(1, vec![ZoneId(100)]).await?;
    pump(&mut server, 3).await?;
    while client.last_tick().is_none() || !client.objects().contains_key(&do_id) {
        client.poll(Duration::from_millis(200)).await?.expect("traffic");
    }
    client.send_ack().await?;

    // Far more frames than the history depth, with no further acks.
    pump(&mut server, 12).await?;

    let mut last_payload = None;
    while let Some(msg) = client.poll(Duration::from_millis(100)).await? {
        if let NetMsg::Tick(payload) = msg {
            last_payload = Some(payload);
        }
    }
    match last_payload.expect("expected tick traffic") {
        TickPayload::Full { .. } => Ok(()),
        TickPayload::Delta { .. } => panic!("evicted baseline still produced a delta"),
    }
}

/// Owned objects appear in the owner's implicit interest, arrive via the
/// owner-generate variant, and die with the client's connection.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn owned_objects_die_with_their_client() -> anyhow::Result<()> {
    init_logging();
    let (mut server, _) = bind_ephemeral(test_config(), test_schema()).await?;

    let mut alice = connect(&mut server, "x").await?;
    let mut bob = connect(&mut server, "x").await?;
    bob.set_interest(1, vec![ZoneId(100)]).await?;
    pump(&mut server, 3).await?;

    // Alice never asked for zone 100; owning an object there is enough.
    let alice_conn = server.conn_of(alice.client_id).unwrap();
    let do_id = server
        .generate_object(1, ZoneId(100), Some(alice_conn), None)
        .await?;
    pump(&mut server, 3).await?;

    let mut saw_owner_generate = false;
    while let Some(msg) = alice.poll(Duration::from_millis(100)).await? {
        if let NetMsg::GenerateOwnerObject { entries } = &msg {
            assert_eq!(entries[0].do_id, do_id);
            saw_owner_generate = true;
        }
    }
    assert!(saw_owner_generate, "owner must get the owner-generate variant");
    assert!(alice.objects().get(&do_id).unwrap().owned);

    while !bob.objects().contains_key(&do_id) {
        bob.poll(Duration::from_millis(200)).await?.expect("bob generate");
    }
    assert!(!bob.objects().get(&do_id).unwrap().owned);

    // Alice disconnects; her object must be force-deleted everywhere.
    alice.disconnect().await?;
    pump(&mut server, 3).await?;
    assert!(!server.directory().contains(do_id));
    assert_eq!(server.client_count(), 1);

    while bob.objects().contains_key(&do_id) {
        bob.poll(Duration::from_millis(200)).await?.expect("bob delete");
    }
    assert!(server
        .drain_events()
        .contains(&ServerEvent::ClientDisconnected(alice.client_id)));
    Ok(())
}

/// Moving an object's zone updates observers without any explicit interest
/// change by the owner.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zone_move_follows_owner_interest() -> anyhow::Result<()> {
    init_logging();
    let (mut server, _) = bind_ephemeral(test_config(), test_schema()).await?;

    let mut alice = connect(&mut server, "x").await?;
    let mut bob = connect(&mut server, "x").await?;
    bob.set_interest(1, vec![ZoneId(100)]).await?;
    pump(&mut server, 3).await?;

    let alice_conn = server.conn_of(alice.client_id).unwrap();
    let do_id = server
        .generate_object(1, ZoneId(200), Some(alice_conn), None)
        .await?;
    pump(&mut server, 2).await?;

    // Move the owned object into bob's zone: bob gains it, alice keeps it.
    server.set_object_zone(do_id, ZoneId(100)).await?;
    pump(&mut server, 2).await?;

    while !bob.objects().contains_key(&do_id) {
        bob.poll(Duration::from_millis(200)).await?.expect("bob generate after move");
    }
    while alice.poll(Duration::from_millis(100)).await?.is_some() {}
    let obj = alice.objects().get(&do_id).expect("owner keeps moved object");
    assert_eq!(obj.zone_id, ZoneId(100));

    // Move it out again: bob loses it.
    server.set_object_zone(do_id, ZoneId(300)).await?;
    pump(&mut server, 2).await?;
    while bob.objects().contains_key(&do_id) {
        bob.poll(Duration::from_millis(200)).await?.expect("bob delete after move");
    }
    Ok(())
}

/// Re-opening interest in a zone ships the object's last packed state as the
/// generate baseline. A deleted-and-recycled id must not: the cache is
/// purged when the id is released.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn prior_state_survives_interest_loss_but_not_id_recycling() -> anyhow::Result<()> {
    init_logging();
    let (mut server, _) = bind_ephemeral(test_config(), test_schema()).await?;
    let do_id = server
        .generate_object(
            1,
            ZoneId(100),
            None,
            Some(vec![FieldValue::Float(7.0), FieldValue::Uint(42)]),
        )
        .await?;

    let mut client = connect(&mut server, "x").await?;
    client.set_interest(1, vec![ZoneId(100)]).await?;
    // A few ticks so the object gets packed into a snapshot.
    pump(&mut server, 3).await?;
    while client.poll(Duration::from_millis(100)).await?.is_some() {}

    // Drop and re-open the zone: the generate must carry prior state.
    client.set_interest(2, vec![]).await?;
    pump(&mut server, 2).await?;
    client.set_interest(3, vec![ZoneId(100)]).await?;
    pump(&mut server, 2).await?;

    let mut saw_prior = false;
    while let Some(msg) = client.poll(Duration::from_millis(100)).await? {
        if let NetMsg::GenerateObject { entries } = &msg {
            let entry = entries.iter().find(|e| e.do_id == do_id).expect("regenerate");
            let prior = entry.prior_state.as_ref().expect("prior state after packing");
            let values = prior.unpack(test_schema().get(1).unwrap())?;
            assert_eq!(values[0], FieldValue::Float(7.0));
            saw_prior = true;
        }
    }
    assert!(saw_prior);

    // Delete and regenerate: the recycled id must start from defaults.
    server.delete_object(do_id).await?;
    let recycled = server.generate_object(1, ZoneId(100), None, None).await?;
    assert_eq!(recycled, do_id, "free-list should hand the id straight back");
    pump(&mut server, 2).await?;

    let mut saw_fresh = false;
    while let Some(msg) = client.poll(Duration::from_millis(100)).await? {
        if let NetMsg::GenerateObject { entries } = &msg {
            let entry = entries.iter().find(|e| e.do_id == recycled).expect("regenerate");
            assert!(
                entry.prior_state.is_none(),
                "recycled id must not inherit the dead object's state"
            );
            saw_fresh = true;
        }
    }
    assert!(saw_fresh);
    Ok(())
}

/// With the optional idle timeout configured, a verified-but-silent client
/// is dropped at a tick boundary.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idle_timeout_drops_silent_clients() -> anyhow::Result<()> {
    init_logging();
    let cfg = ServerConfig {
        idle_timeout_secs: Some(1.0),
        ..test_config()
    };
    let (mut server, _) = bind_ephemeral(cfg, test_schema()).await?;

    let _client = connect(&mut server, "x").await?;
    assert_eq!(server.client_count(), 1);

    // 70 more frames of virtual time puts the client well past one second
    // of silence.
    pump(&mut server, 70).await?;
    assert_eq!(server.client_count(), 0);
    assert!(matches!(
        server.drain_events().last(),
        Some(ServerEvent::ClientDisconnected(_))
    ));
    Ok(())
}

/// Out-of-state traffic is dropped without tearing the session down: a
/// connection can babble verified-only messages before its hello and still
/// verify, and a duplicate hello after verification is a no-op.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn out_of_state_messages_are_ignored() -> anyhow::Result<()> {
    init_logging();
    let (mut server, addr) = bind_ephemeral(test_config(), test_schema()).await?;

    let mut conn = ReliableConn::connect(addr).await?;
    // Verified-only messages sent while still unverified.
    conn.send(&NetMsg::SetInterest {
        handle: 1,
        zones: vec![ZoneId(100)],
    })
    .await?;
    conn.send(&NetMsg::TickAck { tick: 3 }).await?;
    pump(&mut server, 3).await?;

    // The session must still be able to verify afterwards.
    let hello = NetMsg::Hello {
        password: "x".to_string(),
        schema_hash: test_schema().schema_hash(),
        update_rate: 60,
        cmd_rate: 30,
    };
    conn.send(&hello).await?;
    pump(&mut server, 3).await?;
    match conn.recv_timeout(Duration::from_millis(500)).await? {
        Some(NetMsg::HelloResp {
            ok: true,
            client_id: Some(id),
            ..
        }) => assert_eq!(id, ClientId(1)),
        other => panic!("expected successful verification, got {other:?}"),
    }

    // A second hello while verified is ignored; the session stays live and
    // keeps answering interest requests.
    conn.send(&hello).await?;
    conn.send(&NetMsg::SetInterest {
        handle: 7,
        zones: vec![],
    })
    .await?;
    pump(&mut server, 3).await?;
    assert_eq!(server.client_count(), 1);
    loop {
        let msg = conn
            .recv_timeout(Duration::from_millis(500))
            .await?
            .expect("session should still be producing traffic");
        match msg {
            NetMsg::HelloResp { .. } => panic!("duplicate hello must not be answered"),
            NetMsg::InterestComplete { handle } => {
                assert_eq!(handle, 7);
                break;
            }
            _ => {}
        }
    }
    Ok(())
}
