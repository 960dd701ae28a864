//! Service-fabric integration: signed service descriptors resolved through
//! the DHT, and gateway policy enforced across the control plane.

use std::collections::BTreeMap;
use std::sync::Arc;

use soulmesh::{
    CallStatus, GatewayService, Keypair, MeshNode, MeshNodeConfig, OpenTunnelRequest,
    OpenTunnelResponse, PodMember, PodPolicy, ServiceDescriptor,
};

async fn local_node() -> Arc<MeshNode> {
    let config = MeshNodeConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        ..Default::default()
    };
    MeshNode::start(Keypair::generate(), config).await.unwrap()
}

async fn introduce(a: &Arc<MeshNode>, b: &Arc<MeshNode>) {
    a.apply_descriptor(b.own_descriptor(1)).await.unwrap();
}

fn pod_policy(pod: &str, member: soulmesh::PeerId, gateway_peer: soulmesh::PeerId) -> PodPolicy {
    PodPolicy {
        pod_id: pod.to_string(),
        members: [(member, PodMember { gateway_allowed: true })]
            .into_iter()
            .collect(),
        gateway_peer,
        allow_private_ranges: false,
        allow_public_internet: false,
        allow_patterns: vec![],
        registered_services: vec![],
        max_tunnels_per_peer: 4,
        max_tunnels_per_pod: 16,
        new_tunnels_per_minute: 10,
        idle_timeout_secs: 300,
        max_lifetime_secs: 3600,
    }
}

fn open_request(pod: &str, host: &str, port: u16) -> OpenTunnelRequest {
    let mut nonce = [0u8; 16];
    getrandom::getrandom(&mut nonce).unwrap();
    OpenTunnelRequest {
        pod_id: pod.to_string(),
        destination_host: host.to_string(),
        destination_port: port,
        service_name: None,
        request_nonce: nonce,
        request_timestamp_ms: 0,
    }
}

async fn open_over_wire(
    caller: &Arc<MeshNode>,
    gateway_node: &Arc<MeshNode>,
    request: &OpenTunnelRequest,
) -> OpenTunnelResponse {
    let payload = bincode::serialize(request).unwrap();
    let (status, reply) = caller
        .call_service(
            &gateway_node.peer_id(),
            GatewayService::SERVICE_NAME,
            "open",
            payload,
        )
        .await
        .unwrap();
    assert_eq!(status, CallStatus::Ok);
    bincode::deserialize(&reply).unwrap()
}

#[tokio::test]
async fn gateway_rejects_blocked_destination_over_wire() {
    let client = local_node().await;
    let gateway = local_node().await;
    introduce(&client, &gateway).await;

    gateway
        .gateway
        .set_pod_policy(pod_policy("pod-1", client.peer_id(), gateway.peer_id()));

    // Loopback is hard-blocked no matter what the pod allows.
    let response =
        open_over_wire(&client, &gateway, &open_request("pod-1", "127.0.0.1", 8080)).await;
    assert!(!response.accepted);
    assert_eq!(response.reason, "destination_blocked");

    client.shutdown().await;
    gateway.shutdown().await;
}

#[tokio::test]
async fn gateway_rejects_non_member_over_wire() {
    let client = local_node().await;
    let gateway = local_node().await;
    introduce(&client, &gateway).await;

    // Pod exists but the caller is not a member.
    let someone_else = Keypair::generate().peer_id();
    gateway
        .gateway
        .set_pod_policy(pod_policy("pod-1", someone_else, gateway.peer_id()));

    let response =
        open_over_wire(&client, &gateway, &open_request("pod-1", "203.0.113.9", 443)).await;
    assert!(!response.accepted);
    assert_eq!(response.reason, "not_pod_member");

    client.shutdown().await;
    gateway.shutdown().await;
}

#[tokio::test]
async fn gateway_rejects_policy_denied_destination_over_wire() {
    let client = local_node().await;
    let gateway = local_node().await;
    introduce(&client, &gateway).await;

    // Member, but neither private nor public destinations are allowed and
    // no pattern matches.
    gateway
        .gateway
        .set_pod_policy(pod_policy("pod-1", client.peer_id(), gateway.peer_id()));

    let response =
        open_over_wire(&client, &gateway, &open_request("pod-1", "203.0.113.9", 443)).await;
    assert!(!response.accepted);
    assert_eq!(response.reason, "policy_denied");

    client.shutdown().await;
    gateway.shutdown().await;
}

#[tokio::test]
async fn service_descriptor_publish_and_resolve_across_nodes() {
    let provider = local_node().await;
    let consumer = local_node().await;
    introduce(&provider, &consumer).await;
    introduce(&consumer, &provider).await;

    let provider_keys = Keypair::generate();
    let mut metadata = BTreeMap::new();
    metadata.insert("proto".to_string(), "chunk-sync/1".to_string());
    let descriptor = ServiceDescriptor::create(
        &provider_keys,
        "chunk-sync",
        "mesh://chunks",
        metadata,
        60_000,
    );
    assert!(descriptor.validate().is_ok());

    // Publish through the provider node's DHT; resolve from the consumer.
    let key = descriptor.service_id();
    let bytes = bincode::serialize(&descriptor).unwrap();
    provider
        .dht
        .put(key, bytes, descriptor.remaining_ttl_secs())
        .await
        .unwrap();

    let found = consumer.dht.get(key).await.unwrap().expect("descriptor bytes");
    let resolved: ServiceDescriptor = bincode::deserialize(&found).unwrap();
    assert_eq!(resolved.service_name, "chunk-sync");
    assert_eq!(resolved.owner, provider_keys.peer_id());
    assert!(resolved.validate().is_ok());

    provider.shutdown().await;
    consumer.shutdown().await;
}
