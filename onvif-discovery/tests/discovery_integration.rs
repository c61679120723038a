//! Integration tests for WS-Discovery runs against loopback doubles
//!
//! These tests validate:
//! - Multicast probe/response handling and per-run deduplication
//! - Types filtering of foreign devices
//! - Unicast HTTP fallback and synthetic identities
//! - The stream API
//! - Rediscovery of a parked device

mod helpers;

use futures::StreamExt;
use helpers::{closed_port, probe_matches, FakeDevice, Responder};
use onvif_discovery::{
    DeviceIdentity, Discovery, DiscoveryConfig, DiscoveryError, DiscoveryMethod, Rediscovery, RediscoveryCallback,
};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const WINDOW: Duration = Duration::from_millis(400);

fn loopback() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

fn config_for(responder: &Responder) -> DiscoveryConfig {
    let mut config = DiscoveryConfig::fast();
    config.multicast_addr = responder.addr;
    config
}

#[tokio::test]
async fn test_multicast_duplicates_reported_once() {
    let responder = Responder::start(vec![FakeDevice::camera("urn:uuid:cam-1", "10.0.0.2")], 3).await;
    let discovery = Discovery::new(config_for(&responder)).unwrap();

    let mut found = Vec::new();
    let count = discovery.run(WINDOW, |d| found.push(d)).await.unwrap();

    // Three probe targets, three repeats each, one device
    assert_eq!(count, 1);
    assert_eq!(found.len(), 1);
    let device = &found[0];
    assert_eq!(device.urn, "urn:uuid:cam-1");
    assert_eq!(device.ip.to_string(), "10.0.0.2");
    assert_eq!(device.name.as_deref(), Some("Test Camera"));
    assert_eq!(device.discovery_method, DiscoveryMethod::Multicast);
}

#[tokio::test]
async fn test_each_run_starts_fresh() {
    let responder = Responder::start(vec![FakeDevice::camera("urn:uuid:cam-1", "10.0.0.2")], 1).await;
    let discovery = Discovery::new(config_for(&responder)).unwrap();

    assert_eq!(discovery.run(WINDOW, |_| {}).await.unwrap(), 1);
    assert_eq!(discovery.run(WINDOW, |_| {}).await.unwrap(), 1);
}

#[tokio::test]
async fn test_foreign_types_filtered() {
    let mut printer = FakeDevice::camera("urn:uuid:printer", "10.0.0.3");
    printer.types = "wprt:PrintDeviceType".to_string();
    let responder = Responder::start(
        vec![printer, FakeDevice::camera("urn:uuid:cam-1", "10.0.0.2")],
        1,
    )
    .await;
    let discovery = Discovery::new(config_for(&responder)).unwrap();

    let mut found = Vec::new();
    discovery.run(WINDOW, |d| found.push(d.urn)).await.unwrap();
    assert_eq!(found, vec!["urn:uuid:cam-1".to_string()]);
}

#[tokio::test]
async fn test_multicast_and_unicast_combined() {
    let responder = Responder::start(vec![FakeDevice::camera("urn:uuid:cam-1", "10.0.0.2")], 2).await;

    let mut server = mockito::Server::new_async().await;
    let port: u16 = server.host_with_port().rsplit(':').next().unwrap().parse().unwrap();
    let unicast_device = FakeDevice::camera("urn:uuid:cam-2", &format!("127.0.0.1:{}", port));
    let mock = server
        .mock("POST", "/onvif/device_service")
        .match_header("content-type", mockito::Matcher::Regex("application/soap\\+xml".into()))
        .match_body(mockito::Matcher::Regex("<d:Probe>".into()))
        .with_status(200)
        .with_body(probe_matches(None, &unicast_device))
        .create_async()
        .await;

    let config = config_for(&responder)
        .with_unicast_target(loopback())
        .with_unicast_port(port);
    let discovery = Discovery::new(config).unwrap();

    let mut found = Vec::new();
    discovery.run(WINDOW, |d| found.push(d)).await.unwrap();
    mock.assert_async().await;

    assert_eq!(found.len(), 2);
    let unicast = found.iter().find(|d| d.urn == "urn:uuid:cam-2").unwrap();
    assert_eq!(unicast.discovery_method, DiscoveryMethod::UnicastDirect);
    assert_eq!(unicast.port, port);
}

#[tokio::test]
async fn test_unresponsive_host_synthesized() {
    let port = closed_port();
    let config = DiscoveryConfig::unicast_only(vec![loopback()]).with_unicast_port(port);
    let discovery = Discovery::new(config).unwrap();

    let mut found: Vec<DeviceIdentity> = Vec::new();
    discovery.run(WINDOW, |d| found.push(d)).await.unwrap();

    assert_eq!(found.len(), 1);
    assert_eq!(found[0].urn, "urn:synthetic:127.0.0.1");
    assert!(found[0].rtsp_only);
    assert_eq!(found[0].discovery_method, DiscoveryMethod::UnicastDirect);
}

#[tokio::test]
async fn test_unresponsive_host_skipped_without_synthesis() {
    let port = closed_port();
    let config = DiscoveryConfig::unicast_only(vec![loopback()])
        .with_unicast_port(port)
        .with_synthesize_unresponsive(false);
    let discovery = Discovery::new(config).unwrap();

    assert_eq!(discovery.run(WINDOW, |_| {}).await.unwrap(), 0);
}

#[tokio::test]
async fn test_stream_form() {
    let responder = Responder::start(
        vec![
            FakeDevice::camera("urn:uuid:cam-1", "10.0.0.2"),
            FakeDevice::camera("urn:uuid:cam-2", "10.0.0.3"),
        ],
        2,
    )
    .await;
    let discovery = Discovery::new(config_for(&responder)).unwrap();

    let mut urns: Vec<String> = discovery.discover(WINDOW).map(|d| d.urn).collect().await;
    urns.sort();
    assert_eq!(urns, vec!["urn:uuid:cam-1".to_string(), "urn:uuid:cam-2".to_string()]);
}

#[tokio::test]
async fn test_invalid_config() {
    let result = Discovery::new(DiscoveryConfig::unicast_only(Vec::new()));
    assert!(matches!(result, Err(DiscoveryError::Configuration(_))));
}

#[tokio::test]
async fn test_rediscovery_fires_on_reappearance() {
    let responder = Responder::start(vec![FakeDevice::camera("urn:uuid:cam-1", "10.0.0.9")], 1).await;
    let rediscovery = Rediscovery::new(config_for(&responder), CancellationToken::new()).unwrap();
    rediscovery.start();

    let mut parked = DeviceIdentity::manual("10.0.0.2".parse().unwrap(), 80);
    parked.urn = "urn:uuid:cam-1".to_string();
    parked.discovery_method = DiscoveryMethod::Multicast;
    let shared = parked.into_shared();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let callback: RediscoveryCallback = Arc::new(move |identity| {
        counter.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(identity);
    });
    assert!(rediscovery.schedule(Arc::clone(&shared), callback));

    let identity = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("device should be rediscovered")
        .unwrap();

    assert!(Arc::ptr_eq(&identity, &shared));
    assert_eq!(shared.read().ip.to_string(), "10.0.0.9");
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(!rediscovery.is_waiting("urn:uuid:cam-1"));

    rediscovery.shutdown().await;
}
