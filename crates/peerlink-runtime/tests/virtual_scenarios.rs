//! Two engines talking over the virtual air through the real backends

use std::time::Duration;

use peerlink_ble::{BleBackendConfig, BleBackendFactory};
use peerlink_bridge::{
    MeshBackendConfig, MeshBackendFactory, NearbyBackendConfig, NearbyBackendFactory,
};
use peerlink_harness::VirtualAir;
use peerlink_runtime::{
    AppEvent, BackendFactory, ConnectionState, EventStream, LinkState, PeerId, PeerlinkConfig,
    PeerlinkHandle, Recipient, RuntimeBuilder, ServiceId,
};

// ----------------------------------------------------------------------------
// Test Utilities
// ----------------------------------------------------------------------------

struct Device {
    handle: PeerlinkHandle,
    events: EventStream,
}

fn create_device(name: &str, factory: impl BackendFactory + 'static) -> Device {
    let handle = RuntimeBuilder::new()
        .with_config(PeerlinkConfig::testing())
        .with_local_name(name)
        .with_backend(factory)
        .build()
        .unwrap();
    let events = handle.events();
    Device { handle, events }
}

/// Skip events until one matches
async fn wait_for(events: &mut EventStream, matches: impl Fn(&AppEvent) -> bool) -> AppEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), events.next_event())
            .await
            .expect("timed out waiting for app event")
            .expect("event stream ended");
        if matches(&event) {
            return event;
        }
    }
}

fn service() -> ServiceId {
    ServiceId::new("peerlink").unwrap()
}

async fn found_peer(device: &mut Device, name: &str) -> PeerId {
    match wait_for(&mut device.events, |e| {
        matches!(e, AppEvent::PeerFound { display_name, .. } if display_name == name)
    })
    .await
    {
        AppEvent::PeerFound { peer_id, .. } => peer_id,
        _ => unreachable!(),
    }
}

async fn connected_peer(device: &mut Device) -> PeerId {
    match wait_for(&mut device.events, |e| {
        matches!(
            e,
            AppEvent::ConnectionState {
                state: LinkState::Connected,
                ..
            }
        )
    })
    .await
    {
        AppEvent::ConnectionState { peer_id, .. } => peer_id,
        _ => unreachable!(),
    }
}

async fn received(device: &mut Device) -> (PeerId, Vec<u8>) {
    match wait_for(&mut device.events, |e| {
        matches!(e, AppEvent::DataReceived { .. })
    })
    .await
    {
        AppEvent::DataReceived { peer_id, bytes } => (peer_id, bytes),
        _ => unreachable!(),
    }
}

// ----------------------------------------------------------------------------
// BLE
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_ble_scenario_fragments_over_small_mtu() {
    let air = VirtualAir::new();
    let mut alice = create_device(
        "Alice",
        BleBackendFactory::new(BleBackendConfig::testing(), air.ble_radio("AA:01")),
    );
    let mut bob = create_device(
        "Bob",
        BleBackendFactory::new(BleBackendConfig::testing(), air.ble_radio("BB:02")),
    );

    alice
        .handle
        .start_advertising("Alice", &service())
        .await
        .unwrap();
    wait_for(&mut alice.events, |e| *e == AppEvent::AdvertisingStarted).await;
    bob.handle.start_discovery(&service()).await.unwrap();
    let alice_id = found_peer(&mut bob, "Alice").await;

    bob.handle.invite(alice_id).await.unwrap();
    assert_eq!(connected_peer(&mut bob).await, alice_id);
    let bob_id = connected_peer(&mut alice).await;
    assert_eq!(
        bob.handle.state(),
        ConnectionState::Connected([alice_id].into_iter().collect())
    );

    // Unit is 2 bytes at MTU 14, so this crosses two frames
    bob.handle
        .send(Recipient::Peer(alice_id), vec![1, 2, 3])
        .await
        .unwrap();
    assert_eq!(received(&mut alice).await, (bob_id, vec![1, 2, 3]));

    let reply: Vec<u8> = (0..40).collect();
    alice
        .handle
        .send(Recipient::Broadcast, reply.clone())
        .await
        .unwrap();
    assert_eq!(received(&mut bob).await, (alice_id, reply));

    bob.handle.stop().await.unwrap();
    wait_for(&mut bob.events, |e| *e == AppEvent::Stopped).await;
    let dropped = wait_for(&mut alice.events, |e| {
        matches!(
            e,
            AppEvent::ConnectionState {
                state: LinkState::NotConnected,
                ..
            }
        )
    })
    .await;
    assert_eq!(
        dropped,
        AppEvent::ConnectionState {
            peer_id: bob_id,
            state: LinkState::NotConnected
        }
    );
    assert_eq!(alice.handle.state(), ConnectionState::Advertising);
}

// ----------------------------------------------------------------------------
// Mesh
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_mesh_scenario_invitation_and_messages() {
    let air = VirtualAir::new();
    let mut alice = create_device(
        "Alice",
        MeshBackendFactory::new(air.mesh_platform(), MeshBackendConfig::default()),
    );
    let mut bob = create_device(
        "Bob",
        MeshBackendFactory::new(air.mesh_platform(), MeshBackendConfig::default()),
    );

    alice
        .handle
        .start_advertising("Alice", &service())
        .await
        .unwrap();
    wait_for(&mut alice.events, |e| *e == AppEvent::AdvertisingStarted).await;
    bob.handle.start_discovery(&service()).await.unwrap();
    let alice_id = found_peer(&mut bob, "Alice").await;

    bob.handle.invite(alice_id).await.unwrap();
    let invitation = wait_for(&mut alice.events, |e| {
        matches!(e, AppEvent::InvitationReceived { .. })
    })
    .await;
    let AppEvent::InvitationReceived {
        peer_id: bob_id,
        display_name,
    } = invitation
    else {
        unreachable!()
    };
    assert_eq!(display_name, "Bob");
    assert_eq!(connected_peer(&mut alice).await, bob_id);
    assert_eq!(connected_peer(&mut bob).await, alice_id);

    // Unframed transport: a large payload is handed over in one piece
    let payload = vec![0xAB; 4096];
    bob.handle
        .send(Recipient::Peer(alice_id), payload.clone())
        .await
        .unwrap();
    assert_eq!(received(&mut alice).await, (bob_id, payload));

    air.mesh_peer_vanished("Alice");
    assert_eq!(
        wait_for(&mut bob.events, |e| matches!(
            e,
            AppEvent::ConnectionState { .. } | AppEvent::PeerLost { .. }
        ))
        .await,
        AppEvent::ConnectionState {
            peer_id: alice_id,
            state: LinkState::NotConnected
        }
    );
    assert_eq!(
        wait_for(&mut bob.events, |_| true).await,
        AppEvent::PeerLost { peer_id: alice_id }
    );
}

// ----------------------------------------------------------------------------
// Nearby
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_nearby_scenario_broadcast() {
    let air = VirtualAir::new();
    let mut alice = create_device(
        "Alice",
        NearbyBackendFactory::new(air.nearby_platform(), NearbyBackendConfig::default()),
    );
    let mut bob = create_device(
        "Bob",
        NearbyBackendFactory::new(air.nearby_platform(), NearbyBackendConfig::default()),
    );

    alice
        .handle
        .start_advertising("Alice", &service())
        .await
        .unwrap();
    wait_for(&mut alice.events, |e| *e == AppEvent::AdvertisingStarted).await;
    bob.handle.start_discovery(&service()).await.unwrap();
    let alice_id = found_peer(&mut bob, "Alice").await;

    bob.handle.invite(alice_id).await.unwrap();
    assert_eq!(connected_peer(&mut bob).await, alice_id);
    let bob_id = connected_peer(&mut alice).await;

    bob.handle
        .send(Recipient::Broadcast, b"hello".to_vec())
        .await
        .unwrap();
    assert_eq!(received(&mut alice).await, (bob_id, b"hello".to_vec()));
}
