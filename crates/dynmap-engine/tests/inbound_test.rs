//! Inbound pipeline: topic in, platform requests out.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};

use dynmap_core::{Api, EngineConfig, Mapping, MappingType, Result, Substitution};
use dynmap_engine::{
    DeviceHints, ExternalId, FixedClock, IdentityResolver, InMemoryIdentityResolver,
    MappingEngine, PlatformId, RequestMethod,
};

const NOW: &str = "2024-01-01T00:00:00.000Z";

fn engine_with(config: EngineConfig, resolver: Arc<dyn IdentityResolver>) -> MappingEngine {
    dynmap_core::logging::init_test_logging();
    let clock = FixedClock(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    MappingEngine::new(config, resolver).with_clock(Arc::new(clock))
}

fn engine(resolver: Arc<InMemoryIdentityResolver>) -> MappingEngine {
    engine_with(EngineConfig::default(), resolver)
}

fn temperature_mapping() -> Mapping {
    Mapping::new("device/+/temperature", Api::Measurement)
        .with_id("temperature")
        .with_target_template(r#"{"type": "c8y_Temperature", "c8y_Temperature": {"T": {"value": 0, "unit": "C"}}}"#)
        .with_substitution(Substitution::new("_TOPIC_LEVEL_[1]", "_IDENTITY_.externalId"))
        .with_substitution(Substitution::new("/value", "c8y_Temperature.T.value"))
}

fn body(value: &str) -> Value {
    serde_json::from_str(value).unwrap()
}

#[tokio::test]
async fn test_single_substitution_measurement() {
    let engine = engine(Arc::new(InMemoryIdentityResolver::new()));
    let mapping = Arc::new(
        Mapping::new("device/+/temperature", Api::Measurement)
            .with_target_template(r#"{"c8y_Temperature": {"T": {"value": 0}}}"#)
            .with_substitution(Substitution::new("/value", "c8y_Temperature.T.value")),
    );

    let requests = engine
        .process(&mapping, br#"{"value": 21.5}"#, "device/123/temperature")
        .await;

    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.target_api, Api::Measurement);
    assert_eq!(request.method, RequestMethod::Post);
    assert!(request.request_body.contains(r#""value":21.5"#));
    let body = body(&request.request_body);
    assert_eq!(body["time"], NOW);
}

#[tokio::test]
async fn test_registered_device() {
    let resolver = Arc::new(InMemoryIdentityResolver::new());
    resolver.register(ExternalId::new("c8y_Serial", "123"), "4711");
    let engine = engine(resolver);
    engine.upsert_mapping(temperature_mapping()).unwrap();

    let contexts = engine
        .process_inbound("device/123/temperature", br#"{"value": 21.5}"#)
        .await;
    assert_eq!(contexts.len(), 1);
    let ctx = &contexts[0];
    assert!(!ctx.has_errors(), "{:?}", ctx.errors);
    assert_eq!(ctx.requests.len(), 1);

    let request = &ctx.requests[0];
    assert_eq!(request.source_id.as_deref(), Some("4711"));
    assert_eq!(request.external_id.as_deref(), Some("123"));
    assert_eq!(request.external_id_type, "c8y_Serial");
    assert_eq!(request.predecessor, None);
    assert_eq!(
        body(&request.request_body),
        json!({
            "type": "c8y_Temperature",
            "c8y_Temperature": {"T": {"value": 21.5, "unit": "C"}},
            "source": {"id": "4711"},
            "time": NOW,
        })
    );
}

#[tokio::test]
async fn test_unmatched_topic() {
    let engine = engine(Arc::new(InMemoryIdentityResolver::new()));
    engine.upsert_mapping(temperature_mapping()).unwrap();

    assert!(engine.process_inbound("device/123/humidity", b"{}").await.is_empty());
    assert!(engine.process_inbound("device/1/2/temperature", b"{}").await.is_empty());
}

#[tokio::test]
async fn test_single_device_fans_out_over_expanded_values() {
    let engine = engine(Arc::new(InMemoryIdentityResolver::new()));
    let mapping = Mapping::new("sensors/+/events", Api::Event)
        .with_target_template(r#"{"type": "reading", "text": ""}"#)
        .with_substitution(Substitution::new("_TOPIC_LEVEL_[1]", "_IDENTITY_.c8ySourceId"))
        .with_substitution(Substitution::new("texts", "text").expand_array());
    engine.upsert_mapping(mapping).unwrap();

    let contexts = engine
        .process_inbound("sensors/42/events", br#"{"texts": ["a", "b", "c"]}"#)
        .await;
    let requests = &contexts[0].requests;
    assert_eq!(requests.len(), 3);

    let texts: Vec<Value> = requests.iter().map(|r| body(&r.request_body)["text"].clone()).collect();
    assert_eq!(texts, vec![json!("a"), json!("b"), json!("c")]);
    for request in requests {
        assert_eq!(request.source_id.as_deref(), Some("42"));
        assert_eq!(body(&request.request_body)["source"]["id"], "42");
    }
}

#[tokio::test]
async fn test_multiple_devices_in_one_message() {
    let engine = engine(Arc::new(InMemoryIdentityResolver::new()));
    let mapping = Mapping::new("gateway/batch", Api::Measurement)
        .with_target_template(r#"{"c8y_Level": {"L": {"value": 0}}}"#)
        .with_substitution(Substitution::new("devices", "_IDENTITY_.c8ySourceId").expand_array())
        .with_substitution(Substitution::new("levels", "c8y_Level.L.value").expand_array());
    engine.upsert_mapping(mapping).unwrap();

    let payload = br#"{"devices": ["1", "2"], "levels": [10, 20]}"#;
    let requests = engine.process_inbound("gateway/batch", payload).await.remove(0).requests;

    assert_eq!(requests.len(), 2);
    assert_eq!(body(&requests[0].request_body)["source"]["id"], "1");
    assert_eq!(body(&requests[0].request_body)["c8y_Level"]["L"]["value"], 10);
    assert_eq!(body(&requests[1].request_body)["source"]["id"], "2");
    assert_eq!(body(&requests[1].request_body)["c8y_Level"]["L"]["value"], 20);
    assert!(requests.iter().all(|r| r.error.is_none()));

    let empty = engine
        .process_inbound("gateway/batch", br#"{"devices": [], "levels": []}"#)
        .await;
    assert!(empty[0].requests.is_empty());
}

#[tokio::test]
async fn test_unexpanded_array_is_one_value() {
    let engine = engine(Arc::new(InMemoryIdentityResolver::new()));
    let mapping = Mapping::new("sensors/+/raw", Api::Event)
        .with_target_template(r#"{"type": "raw", "text": "", "samples": []}"#)
        .with_substitution(Substitution::new("_TOPIC_LEVEL_[1]", "_IDENTITY_.c8ySourceId"))
        .with_substitution(Substitution::new("samples", "samples"));
    engine.upsert_mapping(mapping).unwrap();

    let requests = engine
        .process_inbound("sensors/1/raw", br#"{"samples": [1, 2, 3, 4]}"#)
        .await
        .remove(0)
        .requests;
    assert_eq!(requests.len(), 1);
    assert_eq!(body(&requests[0].request_body)["samples"], json!([1, 2, 3, 4]));
}

#[tokio::test]
async fn test_implicit_device_creation() {
    let resolver = Arc::new(InMemoryIdentityResolver::new());
    let engine = engine(resolver.clone());
    engine
        .upsert_mapping(temperature_mapping().create_non_existing_device(true))
        .unwrap();

    let requests = engine
        .process_inbound("device/abc/temperature", br#"{"value": 3}"#)
        .await
        .remove(0)
        .requests;
    assert_eq!(requests.len(), 2);

    let creation = &requests[0];
    assert_eq!(creation.target_api, Api::Inventory);
    assert_eq!(creation.method, RequestMethod::Post);
    assert_eq!(creation.external_id.as_deref(), Some("abc"));
    assert_eq!(body(&creation.request_body)["name"], "device_c8y_Serial_abc");
    assert!(body(&creation.request_body).get("type").is_none());

    let measurement = &requests[1];
    assert_eq!(measurement.predecessor, Some(0));
    assert_eq!(measurement.source_id, creation.source_id);
    assert!(measurement.error.is_none());
    assert_eq!(resolver.len(), 1);

    // The second message finds the device.
    let requests = engine
        .process_inbound("device/abc/temperature", br#"{"value": 4}"#)
        .await
        .remove(0)
        .requests;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].predecessor, None);
}

#[tokio::test]
async fn test_implicit_device_carries_mapping_device_type() {
    let resolver = Arc::new(InMemoryIdentityResolver::new());
    let engine = engine(resolver.clone());
    engine
        .upsert_mapping(
            temperature_mapping()
                .create_non_existing_device(true)
                .with_device_type("c8y_TemperatureSensor"),
        )
        .unwrap();

    let requests = engine
        .process_inbound("device/t1/temperature", br#"{"value": 7}"#)
        .await
        .remove(0)
        .requests;
    assert_eq!(requests.len(), 2);
    let creation = body(&requests[0].request_body);
    assert_eq!(creation["type"], "c8y_TemperatureSensor");
    assert_eq!(creation["name"], "device_c8y_Serial_t1");
    assert_eq!(creation["c8y_IsDevice"], json!({}));
}

#[tokio::test]
async fn test_unknown_device_without_creation() {
    let engine = engine(Arc::new(InMemoryIdentityResolver::new()));
    engine.upsert_mapping(temperature_mapping()).unwrap();

    let ctx = engine
        .process_inbound("device/ghost/temperature", br#"{"value": 1}"#)
        .await
        .remove(0);
    assert_eq!(ctx.requests.len(), 1);
    let error = ctx.requests[0].error.as_deref().unwrap();
    assert!(error.contains("c8y_Serial:ghost"), "{}", error);
    assert!(ctx.has_errors());
}

#[tokio::test]
async fn test_dry_run() {
    let resolver = Arc::new(InMemoryIdentityResolver::new());
    let engine = engine_with(EngineConfig::default().dry_run(), resolver.clone());
    engine
        .upsert_mapping(temperature_mapping().create_non_existing_device(true))
        .unwrap();

    let requests = engine
        .process_inbound("device/dry/temperature", br#"{"value": 1}"#)
        .await
        .remove(0)
        .requests;

    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].source_id, None);
    assert_eq!(requests[1].predecessor, Some(0));
    assert!(requests.iter().all(|r| r.error.is_none()));
    assert!(resolver.is_empty());
}

#[tokio::test]
async fn test_inventory_update() {
    let resolver = Arc::new(InMemoryIdentityResolver::new());
    resolver.register(ExternalId::new("c8y_Imei", "351"), "900");
    let engine = engine(resolver);
    let mapping = Mapping::new("things/+/info", Api::Inventory)
        .with_external_id_type("c8y_Imei")
        .with_target_template(r#"{"name": "", "c8y_Firmware": {"version": ""}}"#)
        .with_substitution(Substitution::new("_TOPIC_LEVEL_[1]", "_IDENTITY_.externalId"))
        .with_substitution(Substitution::new("fw", "c8y_Firmware.version"))
        .with_substitution(Substitution::new("name", "name"))
        .update_existing_device(true);
    engine.upsert_mapping(mapping).unwrap();

    let payload = br#"{"fw": "1.2.0", "name": "pump"}"#;
    let known = engine.process_inbound("things/351/info", payload).await.remove(0);
    assert_eq!(known.requests.len(), 1);
    assert_eq!(known.requests[0].method, RequestMethod::Patch);
    assert_eq!(known.requests[0].source_id.as_deref(), Some("900"));
    assert!(body(&known.requests[0].request_body).get("time").is_none());

    let unknown = engine.process_inbound("things/352/info", payload).await.remove(0);
    assert_eq!(unknown.requests.len(), 1);
    assert_eq!(unknown.requests[0].method, RequestMethod::Post);
    assert!(unknown.requests[0].error.is_none());
}

#[tokio::test]
async fn test_filter_skips_message() {
    let engine = engine(Arc::new(InMemoryIdentityResolver::new()));
    let mapping = Mapping::new("device/+/alarm", Api::Alarm)
        .with_target_template(r#"{"type": "c8y_HighTemp", "text": "too hot", "severity": "MAJOR"}"#)
        .with_substitution(Substitution::new("_TOPIC_LEVEL_[1]", "_IDENTITY_.c8ySourceId"))
        .with_filter("value > `50`");
    engine.upsert_mapping(mapping).unwrap();

    let cool = engine.process_inbound("device/9/alarm", br#"{"value": 20}"#).await.remove(0);
    assert!(cool.filtered);
    assert!(cool.requests.is_empty());

    let hot = engine.process_inbound("device/9/alarm", br#"{"value": 80}"#).await.remove(0);
    assert!(!hot.filtered);
    assert_eq!(hot.requests.len(), 1);
    assert_eq!(body(&hot.requests[0].request_body)["severity"], "MAJOR");
}

#[tokio::test]
async fn test_flat_file_and_binary_payloads() {
    let engine = engine(Arc::new(InMemoryIdentityResolver::new()));
    let event = |id: &str, topic: &str, mapping_type| {
        Mapping::new(topic, Api::Event)
            .with_id(id)
            .with_mapping_type(mapping_type)
            .with_target_template(r#"{"type": "raw", "text": ""}"#)
            .with_substitution(Substitution::new("_TOPIC_LEVEL_[1]", "_IDENTITY_.c8ySourceId"))
            .with_substitution(Substitution::new("message", "text"))
    };
    engine.upsert_mapping(event("csv", "csv/+/line", MappingType::FlatFile)).unwrap();
    engine.upsert_mapping(event("bin", "bin/+/frame", MappingType::Binary)).unwrap();

    let csv = engine.process_inbound("csv/5/line", b"21.5;C;ok").await.remove(0);
    assert_eq!(body(&csv.requests[0].request_body)["text"], "21.5;C;ok");

    let bin = engine.process_inbound("bin/5/frame", &[0xde, 0xad, 0xbe, 0xef]).await.remove(0);
    assert_eq!(body(&bin.requests[0].request_body)["text"], "deadbeef");
}

#[tokio::test]
async fn test_invalid_json_payload() {
    let engine = engine(Arc::new(InMemoryIdentityResolver::new()));
    engine.upsert_mapping(temperature_mapping()).unwrap();

    let ctx = engine
        .process_inbound("device/1/temperature", b"not json")
        .await
        .remove(0);
    assert!(ctx.requests.is_empty());
    assert!(matches!(ctx.errors[0], dynmap_core::Error::Extraction(_)));
}

#[tokio::test]
async fn test_identity_cache() {
    let resolver = Arc::new(InMemoryIdentityResolver::new());
    resolver.register(ExternalId::new("c8y_Serial", "7"), "70");
    let engine = engine(resolver.clone());
    engine.upsert_mapping(temperature_mapping()).unwrap();

    for _ in 0..5 {
        engine.process_inbound("device/7/temperature", br#"{"value": 1}"#).await;
    }
    assert_eq!(resolver.lookups(), 1);
}

/// Identity service that cannot be reached.
struct Offline;

#[async_trait]
impl IdentityResolver for Offline {
    async fn resolve_external_id(&self, _: &ExternalId) -> Result<Option<PlatformId>> {
        Err(anyhow::anyhow!("identity service unreachable").into())
    }

    async fn create_device(&self, _: &ExternalId, _: &DeviceHints) -> Result<PlatformId> {
        Err(anyhow::anyhow!("identity service unreachable").into())
    }
}

#[tokio::test]
async fn test_identity_failure_is_local_to_the_request() {
    let engine = engine_with(EngineConfig::default(), Arc::new(Offline));
    engine.upsert_mapping(temperature_mapping()).unwrap();

    let ctx = engine
        .process_inbound("device/1/temperature", br#"{"value": 1}"#)
        .await
        .remove(0);
    assert_eq!(ctx.requests.len(), 1);
    let error = ctx.requests[0].error.as_deref().unwrap();
    assert!(error.contains("unreachable"), "{}", error);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_processing_during_rebuilds() {
    let engine = Arc::new(engine(Arc::new(InMemoryIdentityResolver::new())));
    let data = Mapping::new("device/+/data", Api::Event)
        .with_id("data")
        .with_target_template(r#"{"type": "data", "text": ""}"#)
        .with_substitution(Substitution::new("_TOPIC_LEVEL_[1]", "_IDENTITY_.c8ySourceId"))
        .with_substitution(Substitution::new("text", "text"));
    engine.rebuild(vec![data.clone()]);

    let mut workers = Vec::new();
    for worker in 0..8 {
        let engine = engine.clone();
        workers.push(tokio::spawn(async move {
            for i in 0..50 {
                let topic = format!("device/{}/data", worker);
                let payload = format!(r#"{{"text": "{}"}}"#, i);
                let contexts = engine.process_inbound(&topic, payload.as_bytes()).await;
                assert_eq!(contexts.len(), 1);
                assert_eq!(contexts[0].requests.len(), 1);
            }
        }));
    }

    for round in 0..20 {
        let extra = Mapping::new(format!("other/{}/+", round), Api::Event)
            .with_substitution(Substitution::new("_TOPIC_LEVEL_[2]", "_IDENTITY_.c8ySourceId"));
        let report = engine.rebuild(vec![data.clone(), extra]);
        assert!(report.is_clean());
        tokio::task::yield_now().await;
    }

    for worker in workers {
        worker.await.unwrap();
    }
    assert_eq!(engine.generation(), 21);
}
