mod common;

use cloudlink_core::engine::config_service::{OPCODE_KEY_ACK, OPCODE_KEY_SET};
use cloudlink_core::wire::{Command, TransportKind};
use cloudlink_core::{
    BackendConfigStore, ConfigStore, EncryptionDataType, OutboundMessage, RequestOptions,
    SledStorage,
};
use common::*;
use std::sync::Arc;

fn sled_store(path: &str) -> Arc<dyn ConfigStore> {
    Arc::new(BackendConfigStore::new(SledStorage::open(path).unwrap()))
}

const KEY: [u8; 16] = *b"persisted-key-01";

#[test]
fn test_key_counter_and_tracking_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_str().unwrap();
    let options = RequestOptions {
        response_needed: false,
        ..Default::default()
    };

    // First run: provision a key, send two requests, receive one message
    let replay = {
        let mut device = device(sm_config(true), udp_transport(), sled_store(path));
        let mut request = vec![OPCODE_KEY_SET];
        request.extend_from_slice(&KEY);
        assert_eq!(device.connector.config_service().handle(&request).unwrap()[0], OPCODE_KEY_ACK);

        assert_eq!(device.ctx.send_request(Command::Data, b"a", options).unwrap(), 0);
        assert_eq!(device.ctx.send_request(Command::Data, b"b", options).unwrap(), 1);

        let datagrams = device.from_cloud(&OutboundMessage::request(5, Command::Data, b"first run"));
        device.push_all(datagrams.clone());
        device.run();
        assert_eq!(device.recorder.body(5), b"first run");
        datagrams
    };
    // device dropped here; sled flushes on every put

    // Second run: same store, fresh engine
    {
        let mut device = device(sm_config(true), udp_transport(), sled_store(path));
        let keyring = device.connector.keyring();
        assert!(keyring.lock().has_key());
        assert!(!keyring.lock().has_previous_key());
        assert_eq!(keyring.lock().request_id(TransportKind::Udp), Some(2));
        assert!(keyring.lock().has_seen(TransportKind::Udp, 5));

        assert_eq!(device.ctx.send_request(Command::Data, b"c", options).unwrap(), 2);

        device.push_all(replay);
        device.run();
        assert!(device.recorder.received().is_empty());

        device.push_all(device.from_cloud(&OutboundMessage::request(6, Command::Data, b"second run")));
        device.run();
        assert_eq!(device.recorder.body(6), b"second run");
    }
}

#[test]
fn test_store_layout() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_str().unwrap();

    {
        let mut device = device(sm_config(true), udp_transport(), sled_store(path));
        device.connector.keyring().lock().install_key(&KEY).unwrap();
        device.ctx.send_request(Command::Ping, b"", RequestOptions::default()).unwrap();
        device.run();
    }

    let store = BackendConfigStore::new(SledStorage::open(path).unwrap());
    assert_eq!(
        store.load(TransportKind::Edp, EncryptionDataType::CurrentKey).unwrap(),
        Some(KEY.to_vec())
    );
    assert_eq!(
        store.load(TransportKind::Udp, EncryptionDataType::RequestId).unwrap(),
        Some(vec![0x00, 0x01])
    );

    let keys: Vec<String> = store.entries().unwrap().into_iter().map(|(k, _)| k).collect();
    assert!(keys.contains(&"sm/edp/current_key".to_string()));
    assert!(keys.contains(&"sm/udp/request_id".to_string()));
}

#[test]
fn test_unkeyed_store_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_str().unwrap();

    let device = device(sm_config(true), udp_transport(), sled_store(path));
    let keyring = device.connector.keyring();
    assert!(!keyring.lock().has_key());
    assert_eq!(keyring.lock().request_id(TransportKind::Udp), Some(0));
}
