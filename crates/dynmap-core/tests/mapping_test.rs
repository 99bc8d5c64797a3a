//! Mapping serialization and validation from configuration documents.

use dynmap_core::{
    Api, Direction, Mapping, RepairStrategy, Substitution, ValidationError, mappings_from_json,
    validate_mapping,
};

const MAPPINGS: &str = r#"[
  {
    "id": "temp-01",
    "name": "Temperature",
    "direction": "INBOUND",
    "mappingTopic": "device/+/temperature",
    "mappingTopicSample": "device/+/temperature",
    "targetAPI": "MEASUREMENT",
    "sourceTemplate": "{\"value\": 21.5}",
    "targetTemplate": "{\"c8y_Temperature\": {\"T\": {\"value\": 0, \"unit\": \"C\"}}, \"type\": \"c8y_TemperatureMeasurement\"}",
    "substitutions": [
      {"pathSource": "_TOPIC_LEVEL_[1]", "pathTarget": "_IDENTITY_.externalId", "definesDeviceIdentifier": true},
      {"pathSource": "/value", "pathTarget": "c8y_Temperature.T.value", "repairStrategy": "USE_FIRST_VALUE_OF_ARRAY"},
      {"pathSource": "unit", "pathTarget": "c8y_Temperature.T.unit", "repairStrategy": "REMOVE_IF_MISSING_OR_NULL"}
    ],
    "qos": "AT_LEAST_ONCE",
    "mapDeviceIdentifier": true,
    "createNonExistingDevice": true,
    "externalIdType": "c8y_Serial",
    "deviceType": "c8y_TemperatureSensor"
  },
  {
    "id": "out-01",
    "direction": "OUTBOUND",
    "mappingTopic": "evt/outbound/+",
    "publishTopic": "evt/outbound/+",
    "filterOutbound": "c8y_CustomEvent",
    "targetAPI": "EVENT",
    "substitutions": [
      {"pathSource": "text", "pathTarget": "message"}
    ]
  }
]"#;

#[test]
fn test_parse_and_round_trip() {
    let mappings = mappings_from_json(MAPPINGS).unwrap();
    assert_eq!(mappings.len(), 2);

    let inbound = &mappings[0];
    assert_eq!(inbound.target_api, Api::Measurement);
    assert_eq!(inbound.substitutions.len(), 3);
    assert!(inbound.substitutions[0].defines_device_identifier);
    assert_eq!(
        inbound.substitutions[2].repair_strategy,
        RepairStrategy::RemoveIfMissingOrNull
    );
    assert_eq!(inbound.device_type.as_deref(), Some("c8y_TemperatureSensor"));
    assert_eq!(mappings[1].device_type, None);

    for mapping in &mappings {
        let reparsed = Mapping::from_json(&mapping.to_json().unwrap()).unwrap();
        assert_eq!(&reparsed, mapping);
        let order: Vec<_> = reparsed.substitutions.iter().map(|s| &s.path_target).collect();
        let expected: Vec<_> = mapping.substitutions.iter().map(|s| &s.path_target).collect();
        assert_eq!(order, expected);
    }

    assert_eq!(mappings[1].direction, Direction::Outbound);
}

#[test]
fn test_configuration_documents_validate() {
    for mapping in mappings_from_json(MAPPINGS).unwrap() {
        assert!(validate_mapping(&mapping).is_ok(), "mapping {}", mapping.id);
    }
}

#[test]
fn test_two_identifier_substitutions_fail_validation() {
    let mapping = Mapping::new("device/+/data", Api::Event)
        .with_id("e1")
        .with_substitution(Substitution::new("a", "_IDENTITY_.externalId").device_identifier())
        .with_substitution(Substitution::new("b", "source.id").device_identifier());

    let errors = validate_mapping(&mapping).unwrap_err();
    assert_eq!(errors, vec![ValidationError::MultipleDeviceIdentifiers { count: 2 }]);
}
