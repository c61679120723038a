use std::sync::Arc;
use std::time::Duration;

use callback_server::ServerConfig;
use mockito::{Matcher, Mock, Server, ServerGuard};
use onvif_stream::{
    DeliveryMode, EventSink, StreamError, SubscriptionConfig, SubscriptionEvent, SubscriptionManager,
    SubscriptionState,
};
use parking_lot::Mutex;
use soap_client::{AuthConfig, DeviceSession, DispatchConfig, RenewalMode, ServiceEndpoints, SoapClient};
use tokio::sync::broadcast;

const URN: &str = "urn:uuid:5f5a69c2-e0ae-504f-829b-00408c1f0001";
const CURRENT: &str = "2024-05-01T10:00:00Z";

fn envelope(body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<env:Envelope xmlns:env="http://www.w3.org/2003/05/soap-envelope"
    xmlns:wsa5="http://www.w3.org/2005/08/addressing"
    xmlns:wsnt="http://docs.oasis-open.org/wsn/b-2"
    xmlns:tev="http://www.onvif.org/ver10/events/wsdl"
    xmlns:tt="http://www.onvif.org/ver10/schema"
    xmlns:tns1="http://www.onvif.org/ver10/topics">
  <env:Body>{body}</env:Body>
</env:Envelope>"#
    )
}

fn grant(response: &str, address: &str, termination: &str) -> String {
    envelope(&format!(
        r#"<{response}>
  <wsnt:SubscriptionReference><wsa5:Address>{address}</wsa5:Address></wsnt:SubscriptionReference>
  <wsnt:CurrentTime>{CURRENT}</wsnt:CurrentTime>
  <wsnt:TerminationTime>{termination}</wsnt:TerminationTime>
</{response}>"#
    ))
}

fn notification_message(topic: &str, name: &str, value: &str) -> String {
    format!(
        r#"<wsnt:NotificationMessage>
  <wsnt:Topic Dialect="http://www.onvif.org/ver10/tev/topicExpression/ConcreteSet">tns1:{topic}</wsnt:Topic>
  <wsnt:Message><tt:Message UtcTime="{CURRENT}" PropertyOperation="Changed">
    <tt:Source><tt:SimpleItem Name="VideoSourceConfigurationToken" Value="1"/></tt:Source>
    <tt:Data><tt:SimpleItem Name="{name}" Value="{value}"/></tt:Data>
  </tt:Message></wsnt:Message>
</wsnt:NotificationMessage>"#
    )
}

fn client() -> SoapClient {
    let config = DispatchConfig::no_retry().with_default_timeout(Duration::from_secs(2));
    SoapClient::with_config(config).unwrap()
}

fn session() -> Arc<DeviceSession> {
    Arc::new(DeviceSession::new(URN, None, AuthConfig::default()))
}

fn endpoints(server: &ServerGuard, push: bool) -> ServiceEndpoints {
    ServiceEndpoints {
        device_service_address: format!("{}/onvif/device_service", server.url()),
        event_service_address: Some(format!("{}/onvif/events", server.url())),
        supports_ws_subscription: push,
        supports_pull_point: true,
        event_topics: vec![
            "RuleEngine/CellMotionDetector/Motion".to_string(),
            "RuleEngine/TamperDetector/Tamper".to_string(),
        ],
        ..Default::default()
    }
}

type Received = Arc<Mutex<Vec<(String, String, String)>>>;

fn recording_sink() -> (EventSink, Received) {
    let received: Received = Arc::new(Mutex::new(Vec::new()));
    let store = received.clone();
    let sink: EventSink = Arc::new(move |topic, name, value| {
        store
            .lock()
            .push((topic.to_string(), name.to_string(), value.to_string()));
    });
    (sink, received)
}

async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..150 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

async fn next_matching<F>(rx: &mut broadcast::Receiver<SubscriptionEvent>, predicate: F) -> Option<SubscriptionEvent>
where
    F: Fn(&SubscriptionEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(event)) if predicate(&event) => return Some(event),
            Ok(Ok(_)) => continue,
            _ => return None,
        }
    }
}

async fn mock_soap(server: &mut ServerGuard, path: &str, marker: &str, body: String) -> Mock {
    server
        .mock("POST", path)
        .match_body(Matcher::Regex(marker.to_string()))
        .with_status(200)
        .with_header("content-type", "application/soap+xml; charset=utf-8")
        .with_body(body)
        .create_async()
        .await
}

async fn push_manager(config: SubscriptionConfig, ports: (u16, u16)) -> SubscriptionManager {
    SubscriptionManager::new(client(), config, Some(ServerConfig::loopback(ports)))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_pull_subscription_delivers_and_unsubscribes() {
    let mut server = Server::new_async().await;
    let pull_address = format!("{}/onvif/pull/1", server.url());

    let create = mock_soap(
        &mut server,
        "/onvif/events",
        "CreatePullPointSubscription",
        grant("tev:CreatePullPointSubscriptionResponse", &pull_address, "2024-05-01T10:10:00Z"),
    )
    .await;
    let sync = mock_soap(
        &mut server,
        "/onvif/pull/1",
        "SetSynchronizationPoint",
        envelope("<tev:SetSynchronizationPointResponse/>"),
    )
    .await;
    let _pull = mock_soap(
        &mut server,
        "/onvif/pull/1",
        "PullMessages",
        envelope(&format!(
            "<tev:PullMessagesResponse><tev:CurrentTime>{CURRENT}</tev:CurrentTime><tev:TerminationTime>2024-05-01T10:10:00Z</tev:TerminationTime>{}</tev:PullMessagesResponse>",
            notification_message("RuleEngine/CellMotionDetector/Motion", "IsMotion", "true")
        )),
    )
    .await;
    let unsubscribe = mock_soap(
        &mut server,
        "/onvif/pull/1",
        "Unsubscribe",
        envelope("<wsnt:UnsubscribeResponse/>"),
    )
    .await;

    let manager = SubscriptionManager::new(client(), SubscriptionConfig::fast(), None)
        .await
        .unwrap();
    let (sink, received) = recording_sink();

    let record = manager
        .subscribe(session(), &endpoints(&server, true), sink)
        .await
        .unwrap();
    assert_eq!(record.mode, DeliveryMode::Pull);
    assert_eq!(record.lifetime, Duration::from_secs(600));
    assert_eq!(record.reference_address, pull_address);
    assert_eq!(manager.state(URN), SubscriptionState::Subscribed);
    create.assert_async().await;
    sync.assert_async().await;

    assert!(wait_for(|| !received.lock().is_empty()).await);
    assert_eq!(
        received.lock()[0],
        (
            "RuleEngine/CellMotionDetector/Motion".to_string(),
            "IsMotion".to_string(),
            "true".to_string()
        )
    );

    manager.unsubscribe(URN).await.unwrap();
    assert_eq!(manager.state(URN), SubscriptionState::Unsubscribed);
    assert!(manager.record(URN).is_none());
    unsubscribe.assert_async().await;
}

#[tokio::test]
async fn test_short_lifetime_is_expired() {
    let mut server = Server::new_async().await;
    let pull_address = format!("{}/onvif/pull/short", server.url());

    mock_soap(
        &mut server,
        "/onvif/events",
        "CreatePullPointSubscription",
        grant("tev:CreatePullPointSubscriptionResponse", &pull_address, "2024-05-01T10:00:30Z"),
    )
    .await;
    mock_soap(
        &mut server,
        "/onvif/pull/short",
        "SetSynchronizationPoint",
        envelope("<tev:SetSynchronizationPointResponse/>"),
    )
    .await;
    let unsubscribe = mock_soap(
        &mut server,
        "/onvif/pull/short",
        "Unsubscribe",
        envelope("<wsnt:UnsubscribeResponse/>"),
    )
    .await;

    // 30 s granted against a 45..=60 s renewal margin
    let manager = SubscriptionManager::new(client(), SubscriptionConfig::pull_only(), None)
        .await
        .unwrap();
    let (sink, _) = recording_sink();

    let err = manager
        .subscribe(session(), &endpoints(&server, false), sink)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StreamError::SubscriptionExpired { lifetime } if lifetime == Duration::from_secs(30)
    ));
    assert_eq!(manager.state(URN), SubscriptionState::Unsubscribed);
    assert!(manager.devices().is_empty());
    unsubscribe.assert_async().await;
}

#[tokio::test]
async fn test_subscribe_fault_leaves_device_unsubscribed() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/onvif/events")
        .with_status(500)
        .with_body("internal error")
        .create_async()
        .await;

    let manager = SubscriptionManager::new(client(), SubscriptionConfig::pull_only(), None)
        .await
        .unwrap();
    let (sink, _) = recording_sink();

    let err = manager
        .subscribe(session(), &endpoints(&server, false), sink)
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::Soap(_)));
    assert_eq!(manager.state(URN), SubscriptionState::Unsubscribed);
}

#[tokio::test]
async fn test_push_delivery_filters_topics() {
    let mut server = Server::new_async().await;
    let sub_address = format!("{}/onvif/sub/1", server.url());
    let subscribe = server
        .mock("POST", "/onvif/events")
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex("Subscribe".to_string()),
            Matcher::Regex("ConsumerReference".to_string()),
            Matcher::Regex("tns1:RuleEngine/CellMotionDetector/Motion".to_string()),
        ]))
        .with_status(200)
        .with_body(grant("wsnt:SubscribeResponse", &sub_address, "2024-05-01T10:10:00Z"))
        .create_async()
        .await;
    mock_soap(&mut server, "/onvif/sub/1", "Unsubscribe", envelope("<wsnt:UnsubscribeResponse/>")).await;

    let manager = push_manager(SubscriptionConfig::fast(), (41100, 41150)).await;
    let (sink, received) = recording_sink();

    let record = manager
        .subscribe(session(), &endpoints(&server, true), sink)
        .await
        .unwrap();
    subscribe.assert_async().await;
    assert_eq!(record.mode, DeliveryMode::Push);
    let route = record.route_key.clone().unwrap();
    assert_eq!(route, "urn-uuid-5f5a69c2-e0ae-504f-829b-00408c1f0001");

    let notify = envelope(&format!(
        "<wsnt:Notify>{}{}</wsnt:Notify>",
        notification_message("Device/HardwareFailure/StorageFailure", "Failed", "true"),
        notification_message("RuleEngine/TamperDetector/Tamper", "IsTamper", "true"),
    ));
    let url = format!("{}/event/{}", manager.listener_url().unwrap(), route);
    let response = reqwest::Client::new()
        .post(&url)
        .header("content-type", "application/soap+xml")
        .body(notify)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    assert!(wait_for(|| !received.lock().is_empty()).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let received = received.lock().clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0, "RuleEngine/TamperDetector/Tamper");
    assert_eq!(received[0].1, "IsTamper");

    manager.shutdown().await;
}

#[tokio::test]
async fn test_renew_before_expiry() {
    let mut server = Server::new_async().await;
    let sub_address = format!("{}/onvif/sub/renew", server.url());
    mock_soap(
        &mut server,
        "/onvif/events",
        "Subscribe",
        grant("wsnt:SubscribeResponse", &sub_address, "2024-05-01T10:00:01Z"),
    )
    .await;
    let renew = server
        .mock("POST", "/onvif/sub/renew")
        .match_body(Matcher::Regex("Renew".to_string()))
        .with_status(200)
        .with_body(envelope(&format!(
            "<wsnt:RenewResponse><wsnt:TerminationTime>2024-05-01T10:00:01Z</wsnt:TerminationTime><wsnt:CurrentTime>{CURRENT}</wsnt:CurrentTime></wsnt:RenewResponse>"
        )))
        .expect_at_least(1)
        .create_async()
        .await;
    mock_soap(&mut server, "/onvif/sub/renew", "Unsubscribe", envelope("<wsnt:UnsubscribeResponse/>")).await;

    let manager = push_manager(SubscriptionConfig::fast(), (41200, 41250)).await;
    let mut events = manager.subscribe_events();
    let (sink, _) = recording_sink();

    let record = manager
        .subscribe(session(), &endpoints(&server, true), sink)
        .await
        .unwrap();
    assert_eq!(record.lifetime, Duration::from_secs(1));
    assert_eq!(record.renewal_mode, RenewalMode::Renew);

    let renewed = next_matching(&mut events, |e| matches!(e, SubscriptionEvent::Renewed { .. })).await;
    assert_eq!(
        renewed,
        Some(SubscriptionEvent::Renewed {
            urn: URN.to_string(),
            lifetime: Duration::from_secs(1)
        })
    );
    renew.assert_async().await;
    assert_eq!(manager.state(URN), SubscriptionState::Subscribed);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_resubscribe_mode_replaces_subscription() {
    let mut server = Server::new_async().await;
    let sub_address = format!("{}/onvif/sub/vendor", server.url());
    let subscribe = server
        .mock("POST", "/onvif/events")
        .match_body(Matcher::Regex("Subscribe".to_string()))
        .with_status(200)
        .with_body(grant("wsnt:SubscribeResponse", &sub_address, "2024-05-01T10:00:01Z"))
        .expect_at_least(2)
        .create_async()
        .await;
    let renew = server
        .mock("POST", "/onvif/sub/vendor")
        .match_body(Matcher::Regex("Renew".to_string()))
        .with_status(200)
        .expect(0)
        .create_async()
        .await;
    mock_soap(&mut server, "/onvif/sub/vendor", "Unsubscribe", envelope("<wsnt:UnsubscribeResponse/>")).await;

    let manager = push_manager(SubscriptionConfig::fast(), (41300, 41350)).await;
    let mut events = manager.subscribe_events();
    let (sink, _) = recording_sink();

    let mut device = endpoints(&server, true);
    device.renewal_mode = RenewalMode::Resubscribe;
    manager.subscribe(session(), &device, sink).await.unwrap();

    let event = next_matching(&mut events, |e| matches!(e, SubscriptionEvent::Resubscribed { .. })).await;
    assert_eq!(
        event,
        Some(SubscriptionEvent::Resubscribed {
            urn: URN.to_string(),
            mode: DeliveryMode::Push
        })
    );
    subscribe.assert_async().await;
    renew.assert_async().await;

    manager.shutdown().await;
}

#[tokio::test]
async fn test_failed_pulls_trigger_fresh_subscription() {
    let mut server = Server::new_async().await;
    let pull_address = format!("{}/onvif/pull/flaky", server.url());

    let create = server
        .mock("POST", "/onvif/events")
        .match_body(Matcher::Regex("CreatePullPointSubscription".to_string()))
        .with_status(200)
        .with_body(grant(
            "tev:CreatePullPointSubscriptionResponse",
            &pull_address,
            "2024-05-01T10:10:00Z",
        ))
        .expect_at_least(2)
        .create_async()
        .await;
    mock_soap(
        &mut server,
        "/onvif/pull/flaky",
        "SetSynchronizationPoint",
        envelope("<tev:SetSynchronizationPointResponse/>"),
    )
    .await;
    server
        .mock("POST", "/onvif/pull/flaky")
        .match_body(Matcher::Regex("PullMessages".to_string()))
        .with_status(503)
        .create_async()
        .await;
    mock_soap(&mut server, "/onvif/pull/flaky", "Unsubscribe", envelope("<wsnt:UnsubscribeResponse/>")).await;

    let config = SubscriptionConfig::fast().with_pull_failure_threshold(2);
    let manager = SubscriptionManager::new(client(), config, None).await.unwrap();
    let mut events = manager.subscribe_events();
    let (sink, _) = recording_sink();

    manager
        .subscribe(session(), &endpoints(&server, false), sink)
        .await
        .unwrap();

    let first = next_matching(&mut events, |e| matches!(e, SubscriptionEvent::Subscribed { .. })).await;
    assert!(first.is_some());
    let second = next_matching(&mut events, |e| matches!(e, SubscriptionEvent::Subscribed { .. })).await;
    assert_eq!(
        second,
        Some(SubscriptionEvent::Subscribed {
            urn: URN.to_string(),
            mode: DeliveryMode::Pull,
            lifetime: Duration::from_secs(600)
        })
    );
    create.assert_async().await;

    manager.shutdown().await;
}

#[tokio::test]
async fn test_subscribe_again_supersedes() {
    let mut server = Server::new_async().await;
    let sub_address = format!("{}/onvif/sub/2", server.url());
    mock_soap(
        &mut server,
        "/onvif/events",
        "Subscribe",
        grant("wsnt:SubscribeResponse", &sub_address, "2024-05-01T10:10:00Z"),
    )
    .await;
    let unsubscribe = server
        .mock("POST", "/onvif/sub/2")
        .match_body(Matcher::Regex("Unsubscribe".to_string()))
        .with_status(200)
        .with_body(envelope("<wsnt:UnsubscribeResponse/>"))
        .expect(1)
        .create_async()
        .await;

    let manager = push_manager(SubscriptionConfig::fast(), (41400, 41450)).await;
    let (first_sink, _) = recording_sink();
    let (second_sink, _) = recording_sink();

    let first = manager
        .subscribe(session(), &endpoints(&server, true), first_sink)
        .await
        .unwrap();
    let first_timer = first.renewal_timer.clone().unwrap();

    let second = manager
        .subscribe(session(), &endpoints(&server, true), second_sink)
        .await
        .unwrap();

    assert!(first_timer.is_cancelled());
    assert_eq!(first.route_key, second.route_key);
    assert_eq!(manager.devices(), vec![URN.to_string()]);
    unsubscribe.assert_async().await;

    manager.shutdown().await;
}
