//! GATT layer behavior: service registration layout, property enforcement,
//! client characteristic configuration and the generic attribute service.

mod common;

use std::cell::RefCell;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{request, TestDb, TestLink, PEER};
use embassy_futures::select::select;
use embassy_futures::yield_now;
use gatt_host::att::{AttErrorCode, Handle};
use gatt_host::attribute::AccessRequirements;
use gatt_host::attribute_server::{AttributeServer, WriteKind};
use gatt_host::gatt::access::{GenericAccessService, PreferredConnectionParameters};
use gatt_host::gatt::generic::{GenericAttributeService, Indicator};
use gatt_host::gatt::{
    Characteristic, CharacteristicProp, Descriptor, IdType, LocalServiceManager, Service,
    ServiceHandler,
};
use gatt_host::types::uuid::Uuid;
use gatt_host::{Error, PeerId};

const HEART_RATE: Uuid = Uuid::new_short(0x180d);
const HEART_RATE_MEASUREMENT: Uuid = Uuid::new_short(0x2a37);

/// The application side of the tests: records calls, serves a fixed value.
#[derive(Default)]
struct AppHandler {
    reads: Vec<(IdType, IdType, u16)>,
    writes: Vec<(IdType, IdType, u16, Vec<u8>, WriteKind)>,
    configs: Vec<(PeerId, IdType, IdType, bool, bool)>,
    value: Vec<u8>,
}

impl ServiceHandler for AppHandler {
    async fn read(
        &mut self,
        _peer: PeerId,
        service_id: IdType,
        id: IdType,
        offset: u16,
        data: &mut [u8],
    ) -> Result<usize, AttErrorCode> {
        self.reads.push((service_id, id, offset));
        let take = self.value.len().min(data.len());
        data[..take].copy_from_slice(&self.value[..take]);
        Ok(take)
    }

    async fn write(
        &mut self,
        _peer: PeerId,
        service_id: IdType,
        id: IdType,
        offset: u16,
        data: &[u8],
        kind: WriteKind,
    ) -> Result<(), AttErrorCode> {
        self.writes.push((service_id, id, offset, data.to_vec(), kind));
        Ok(())
    }

    fn characteristic_configured(
        &mut self,
        peer: PeerId,
        service_id: IdType,
        chrc_id: IdType,
        notify: bool,
        indicate: bool,
    ) {
        self.configs.push((peer, service_id, chrc_id, notify, indicate));
    }
}

fn measurement_service(props: impl Into<gatt_host::gatt::CharacteristicProps>) -> Service {
    let mut service = Service::new(true, HEART_RATE.clone());
    service
        .add_characteristic(Characteristic::new(
            7,
            HEART_RATE_MEASUREMENT.clone(),
            props,
            0,
            AccessRequirements::allowed(),
            AccessRequirements::allowed(),
            AccessRequirements::allowed(),
        ))
        .unwrap();
    service
}

#[tokio::test]
async fn register_service_layout() {
    let db = TestDb::new();
    let manager = LocalServiceManager::new(&db);

    let mut service = Service::new(true, HEART_RATE.clone());
    let mut chrc = Characteristic::new(
        5,
        HEART_RATE_MEASUREMENT.clone(),
        [
            CharacteristicProp::Read,
            CharacteristicProp::Write,
            CharacteristicProp::Notify,
        ],
        0,
        AccessRequirements::allowed(),
        AccessRequirements::allowed(),
        AccessRequirements::allowed(),
    );
    chrc.add_descriptor(Descriptor::new(
        6,
        Uuid::new_short(0x2904),
        AccessRequirements::allowed(),
        AccessRequirements::disallowed(),
    ))
    .unwrap();
    service.add_characteristic(chrc).unwrap();

    let id = manager.register_service(service).await.unwrap();
    assert_eq!(id, 1);

    let guard = db.lock().await;
    let grouping = guard.grouping(1).unwrap();
    assert!(grouping.active());
    assert_eq!(grouping.end_handle(), 5);

    // Service declaration.
    let decl = guard.find_attribute(1).unwrap();
    assert_eq!(decl.att_type(), &Uuid::new_short(0x2800));
    assert_eq!(decl.value(), Some([0x0d, 0x18].as_slice()));

    // Characteristic declaration: properties, value handle, UUID.
    let chrc_decl = guard.find_attribute(2).unwrap();
    assert_eq!(chrc_decl.att_type(), &Uuid::new_short(0x2803));
    assert_eq!(chrc_decl.value(), Some([0x1a, 0x03, 0x00, 0x37, 0x2a].as_slice()));

    // Characteristic value: dynamic, typed by the characteristic UUID.
    let value = guard.find_attribute(3).unwrap();
    assert_eq!(value.att_type(), &HEART_RATE_MEASUREMENT);
    assert!(value.is_dynamic());

    // Synthesized client characteristic configuration.
    let ccc = guard.find_attribute(4).unwrap();
    assert_eq!(ccc.att_type(), &Uuid::new_short(0x2902));
    assert!(ccc.is_dynamic());

    // The user descriptor comes last.
    let desc = guard.find_attribute(5).unwrap();
    assert_eq!(desc.att_type(), &Uuid::new_short(0x2904));
}

#[tokio::test]
async fn extended_properties_descriptor_synthesized() {
    let db = TestDb::new();
    let manager = LocalServiceManager::new(&db);

    let mut service = Service::new(true, HEART_RATE.clone());
    service
        .add_characteristic(Characteristic::new(
            1,
            HEART_RATE_MEASUREMENT.clone(),
            [CharacteristicProp::Read, CharacteristicProp::Extended],
            gatt_host::gatt::EXTENDED_PROP_RELIABLE_WRITE,
            AccessRequirements::allowed(),
            AccessRequirements::disallowed(),
            AccessRequirements::disallowed(),
        ))
        .unwrap();
    service.add_characteristic(chrc_without_props(2)).unwrap();

    manager.register_service(service).await.unwrap();

    let guard = db.lock().await;
    let ext = guard.find_attribute(4).unwrap();
    assert_eq!(ext.att_type(), &Uuid::new_short(0x2900));
    assert_eq!(ext.value(), Some([0x01, 0x00].as_slice()));
}

fn chrc_without_props(id: IdType) -> Characteristic {
    Characteristic::new(
        id,
        Uuid::new_short(0x2a00),
        [CharacteristicProp::Read],
        0,
        AccessRequirements::allowed(),
        AccessRequirements::disallowed(),
        AccessRequirements::disallowed(),
    )
}

#[tokio::test]
async fn characteristics_sorted_by_uuid_size() {
    let db = TestDb::new();
    let manager = LocalServiceManager::new(&db);

    let custom = Uuid::new_long([
        0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1a, 0x1b, 0x1c, 0x1d,
        0x1e, 0x1f,
    ]);
    let mut service = Service::new(true, HEART_RATE.clone());
    service
        .add_characteristic(Characteristic::new(
            1,
            custom.clone(),
            [CharacteristicProp::Read],
            0,
            AccessRequirements::allowed(),
            AccessRequirements::disallowed(),
            AccessRequirements::disallowed(),
        ))
        .unwrap();
    service.add_characteristic(chrc_without_props(2)).unwrap();

    manager.register_service(service).await.unwrap();

    // The 16-bit characteristic is laid out first despite declaration order.
    let guard = db.lock().await;
    let first = guard.find_attribute(3).unwrap();
    assert_eq!(first.att_type(), &Uuid::new_short(0x2a00));
    let second = guard.find_attribute(5).unwrap();
    assert_eq!(second.att_type(), &custom);
}

#[tokio::test]
async fn duplicate_ids_rejected() {
    let db = TestDb::new();
    let manager = LocalServiceManager::new(&db);

    let mut service = Service::new(true, HEART_RATE.clone());
    service.add_characteristic(chrc_without_props(3)).unwrap();
    service.add_characteristic(chrc_without_props(3)).unwrap();
    assert_eq!(
        manager.register_service(service).await,
        Err(Error::InvalidServiceDefinition)
    );

    // Descriptor ids share the namespace with characteristic ids.
    let mut service = Service::new(true, HEART_RATE.clone());
    let mut chrc = chrc_without_props(3);
    chrc.add_descriptor(Descriptor::new(
        3,
        Uuid::new_short(0x2904),
        AccessRequirements::allowed(),
        AccessRequirements::disallowed(),
    ))
    .unwrap();
    service.add_characteristic(chrc).unwrap();
    assert_eq!(
        manager.register_service(service).await,
        Err(Error::InvalidServiceDefinition)
    );

    // Nothing leaked into the database.
    assert!(db.lock().await.groupings().is_empty());
}

#[tokio::test]
async fn reserved_descriptor_types_rejected() {
    let db = TestDb::new();
    let manager = LocalServiceManager::new(&db);

    for reserved in [0x2900u16, 0x2902, 0x2903] {
        let mut service = Service::new(true, HEART_RATE.clone());
        let mut chrc = chrc_without_props(1);
        chrc.add_descriptor(Descriptor::new(
            2,
            Uuid::new_short(reserved),
            AccessRequirements::allowed(),
            AccessRequirements::disallowed(),
        ))
        .unwrap();
        service.add_characteristic(chrc).unwrap();
        assert_eq!(
            manager.register_service(service).await,
            Err(Error::InvalidServiceDefinition)
        );
    }
}

#[tokio::test]
async fn unregister_frees_handles_for_reuse() {
    let db = TestDb::new();
    let manager = LocalServiceManager::new(&db);
    let events = manager.service_changes();

    let first = manager
        .register_service(measurement_service([CharacteristicProp::Read]))
        .await
        .unwrap();
    let second = manager
        .register_service(measurement_service([CharacteristicProp::Read]))
        .await
        .unwrap();
    assert_eq!((first, second), (1, 2));

    assert!(manager.unregister_service(first).await);
    assert!(!manager.unregister_service(first).await);

    let third = manager
        .register_service(measurement_service([CharacteristicProp::Read]))
        .await
        .unwrap();
    assert_eq!(third, 3);

    let ev = events.receive().await;
    assert_eq!((ev.service_id, ev.start), (1, 1));
    let ev = events.receive().await;
    assert_eq!(ev.service_id, 2);
    let ev = events.receive().await;
    assert_eq!((ev.service_id, ev.start), (1, 1));
    // The freed range was reused by the third service.
    let ev = events.receive().await;
    assert_eq!((ev.service_id, ev.start), (3, 1));
}

#[tokio::test]
async fn property_bits_gate_procedures() {
    let db = TestDb::new();
    let manager = LocalServiceManager::new(&db);

    let mut service = Service::new(true, HEART_RATE.clone());
    for (id, prop) in [
        (1, CharacteristicProp::Read),
        (2, CharacteristicProp::Write),
        (3, CharacteristicProp::WriteWithoutResponse),
    ] {
        service
            .add_characteristic(Characteristic::new(
                id,
                Uuid::new_short(0x2a00 + id as u16),
                [prop],
                0,
                AccessRequirements::allowed(),
                AccessRequirements::allowed(),
                AccessRequirements::disallowed(),
            ))
            .unwrap();
    }
    let service_id = manager.register_service(service).await.unwrap();

    // Layout: 1 service, then (decl, value) pairs at (2,3), (4,5), (6,7).
    let link = TestLink::new();
    let server = AttributeServer::new(&db, link.bearer(), PEER);
    let mut app = AppHandler {
        value: vec![0x42],
        ..Default::default()
    };
    let mut handler = manager.handler(PEER, &mut app);

    // Reads need the read property.
    let rsp = request(&server, &mut handler, &[0x0a, 0x03, 0x00]).await;
    assert_eq!(rsp.unwrap(), [0x0b, 0x42]);
    let rsp = request(&server, &mut handler, &[0x0a, 0x05, 0x00]).await;
    assert_eq!(rsp.unwrap(), [0x01, 0x0a, 0x05, 0x00, 0x02]);

    // Write requests need the write property, commands the
    // write-without-response property. No fallbacks either way.
    let rsp = request(&server, &mut handler, &[0x12, 0x03, 0x00, 0xaa]).await;
    assert_eq!(rsp.unwrap(), [0x01, 0x12, 0x03, 0x00, 0x03]);
    let rsp = request(&server, &mut handler, &[0x12, 0x05, 0x00, 0xaa]).await;
    assert_eq!(rsp.unwrap(), [0x13]);
    let rsp = request(&server, &mut handler, &[0x12, 0x07, 0x00, 0xaa]).await;
    assert_eq!(rsp.unwrap(), [0x01, 0x12, 0x07, 0x00, 0x03]);

    let rsp = request(&server, &mut handler, &[0x52, 0x05, 0x00, 0xbb]).await;
    assert_eq!(rsp, None);
    let rsp = request(&server, &mut handler, &[0x52, 0x07, 0x00, 0xbb]).await;
    assert_eq!(rsp, None);

    drop(handler);
    assert_eq!(app.reads, [(service_id, 1, 0)]);
    assert_eq!(
        app.writes,
        [
            (service_id, 2, 0, vec![0xaa], WriteKind::Request),
            (service_id, 3, 0, vec![0xbb], WriteKind::Command),
        ]
    );
}

#[tokio::test]
async fn ccc_subscription_round_trip() {
    let db = TestDb::new();
    let manager = LocalServiceManager::new(&db);
    let service_id = manager
        .register_service(measurement_service([
            CharacteristicProp::Notify,
            CharacteristicProp::Indicate,
        ]))
        .await
        .unwrap();

    // Layout: 1 service, 2 declaration, 3 value, 4 CCC.
    let link = TestLink::new();
    let server = AttributeServer::new(&db, link.bearer(), PEER);
    let mut app = AppHandler::default();
    let mut handler = manager.handler(PEER, &mut app);

    // Defaults to zero.
    let rsp = request(&server, &mut handler, &[0x0a, 0x04, 0x00]).await;
    assert_eq!(rsp.unwrap(), [0x0b, 0x00, 0x00]);

    // Enable notifications.
    let rsp = request(&server, &mut handler, &[0x12, 0x04, 0x00, 0x01, 0x00]).await;
    assert_eq!(rsp.unwrap(), [0x13]);
    let rsp = request(&server, &mut handler, &[0x0a, 0x04, 0x00]).await;
    assert_eq!(rsp.unwrap(), [0x0b, 0x01, 0x00]);

    // Re-writing the same value is not a configuration change.
    let rsp = request(&server, &mut handler, &[0x12, 0x04, 0x00, 0x01, 0x00]).await;
    assert_eq!(rsp.unwrap(), [0x13]);

    // Enable both bits, then clear.
    let rsp = request(&server, &mut handler, &[0x12, 0x04, 0x00, 0x03, 0x00]).await;
    assert_eq!(rsp.unwrap(), [0x13]);
    let rsp = request(&server, &mut handler, &[0x12, 0x04, 0x00, 0x00, 0x00]).await;
    assert_eq!(rsp.unwrap(), [0x13]);

    drop(handler);
    assert_eq!(
        app.configs,
        [
            (PEER, service_id, 7, true, false),
            (PEER, service_id, 7, true, true),
            (PEER, service_id, 7, false, false),
        ]
    );

    let cfg = manager
        .get_characteristic_config(service_id, 7, PEER)
        .unwrap();
    assert_eq!((cfg.handle, cfg.notify, cfg.indicate), (3, false, false));
}

#[tokio::test]
async fn ccc_write_validation() {
    let db = TestDb::new();
    let manager = LocalServiceManager::new(&db);
    manager
        .register_service(measurement_service([CharacteristicProp::Notify]))
        .await
        .unwrap();

    let link = TestLink::new();
    let server = AttributeServer::new(&db, link.bearer(), PEER);
    let mut app = AppHandler::default();
    let mut handler = manager.handler(PEER, &mut app);

    // Only the two low bits are defined.
    let rsp = request(&server, &mut handler, &[0x12, 0x04, 0x00, 0x04, 0x00]).await;
    assert_eq!(rsp.unwrap(), [0x01, 0x12, 0x04, 0x00, 0x04]);

    // Exactly 16 bits.
    let rsp = request(&server, &mut handler, &[0x12, 0x04, 0x00, 0x01]).await;
    assert_eq!(rsp.unwrap(), [0x01, 0x12, 0x04, 0x00, 0x0d]);

    // Indications are not supported by this characteristic.
    let rsp = request(&server, &mut handler, &[0x12, 0x04, 0x00, 0x02, 0x00]).await;
    assert_eq!(rsp.unwrap(), [0x01, 0x12, 0x04, 0x00, 0x03]);

    drop(handler);
    assert!(app.configs.is_empty());
}

#[tokio::test]
async fn ccc_write_respects_update_security() {
    let db = TestDb::new();
    let manager = LocalServiceManager::new(&db);

    let mut service = Service::new(true, HEART_RATE.clone());
    service
        .add_characteristic(Characteristic::new(
            7,
            HEART_RATE_MEASUREMENT.clone(),
            [CharacteristicProp::Indicate],
            0,
            AccessRequirements::disallowed(),
            AccessRequirements::disallowed(),
            AccessRequirements::new(true, false, false),
        ))
        .unwrap();
    let service_id = manager.register_service(service).await.unwrap();

    let link = TestLink::new();
    let server = AttributeServer::new(&db, link.bearer(), PEER);
    let mut app = AppHandler::default();
    let mut handler = manager.handler(PEER, &mut app);

    // Unencrypted link: the subscription write is refused by the ATT layer
    // and no configuration callback fires.
    let rsp = request(&server, &mut handler, &[0x12, 0x04, 0x00, 0x02, 0x00]).await;
    assert_eq!(rsp.unwrap(), [0x01, 0x12, 0x04, 0x00, 0x05]);

    link.set_security(gatt_host::security::SecurityProperties::new(
        gatt_host::security::SecurityLevel::Encrypted,
        16,
    ));
    let rsp = request(&server, &mut handler, &[0x12, 0x04, 0x00, 0x02, 0x00]).await;
    assert_eq!(rsp.unwrap(), [0x13]);

    drop(handler);
    assert_eq!(app.configs, [(PEER, service_id, 7, false, true)]);
}

#[tokio::test]
async fn disconnect_wipes_client_state() {
    let db = TestDb::new();
    let manager = LocalServiceManager::new(&db);
    let service_id = manager
        .register_service(measurement_service([CharacteristicProp::Notify]))
        .await
        .unwrap();

    let link = TestLink::new();
    let server = AttributeServer::new(&db, link.bearer(), PEER);
    let mut app = AppHandler::default();
    let mut handler = manager.handler(PEER, &mut app);
    request(&server, &mut handler, &[0x12, 0x04, 0x00, 0x01, 0x00]).await;

    let other = PeerId(2);
    let cfg = manager
        .get_characteristic_config(service_id, 7, PEER)
        .unwrap();
    assert!(cfg.notify);
    // Other peers read as zero.
    let cfg = manager
        .get_characteristic_config(service_id, 7, other)
        .unwrap();
    assert!(!cfg.notify);

    manager.disconnect_client(PEER);
    let cfg = manager
        .get_characteristic_config(service_id, 7, PEER)
        .unwrap();
    assert!(!cfg.notify && !cfg.indicate);
}

struct RecordingIndicator {
    sent: RefCell<Vec<(PeerId, Handle, Vec<u8>)>>,
}

impl Indicator for RecordingIndicator {
    type Error = Infallible;

    async fn indicate(
        &self,
        peer: PeerId,
        handle: Handle,
        value: &[u8],
    ) -> Result<(), Self::Error> {
        self.sent.borrow_mut().push((peer, handle, value.to_vec()));
        Ok(())
    }
}

static PERSIST_CALLS: AtomicUsize = AtomicUsize::new(0);

fn persist_hook(_peer: PeerId, _notify: bool, _indicate: bool) {
    PERSIST_CALLS.fetch_add(1, Ordering::SeqCst);
}

#[tokio::test]
async fn service_changed_indications() {
    let db = TestDb::new();
    let manager = LocalServiceManager::new(&db);
    let gas = GenericAttributeService::register(&manager).await.unwrap();
    gas.set_persist_hook(persist_hook);

    // The generic attribute service occupies handles 1..4 with the CCC at 4.
    {
        let guard = db.lock().await;
        let decl = guard.find_attribute(1).unwrap();
        assert_eq!(decl.value(), Some([0x01, 0x18].as_slice()));
        assert_eq!(
            guard.find_attribute(3).unwrap().att_type(),
            &Uuid::new_short(0x2a05)
        );
        assert_eq!(
            guard.find_attribute(4).unwrap().att_type(),
            &Uuid::new_short(0x2902)
        );
    }

    // Subscribe to indications.
    let link = TestLink::new();
    let server = AttributeServer::new(&db, link.bearer(), PEER);
    let mut app = AppHandler::default();
    let mut handler = manager.handler(PEER, gas.wrap(&mut app));
    let persisted_before = PERSIST_CALLS.load(Ordering::SeqCst);
    let rsp = request(&server, &mut handler, &[0x12, 0x04, 0x00, 0x02, 0x00]).await;
    assert_eq!(rsp.unwrap(), [0x13]);
    assert_eq!(PERSIST_CALLS.load(Ordering::SeqCst), persisted_before + 1);
    drop(handler);

    // Registering a service indicates its range to the subscriber; the
    // service's own registration event from before the subscription is
    // suppressed.
    let second = manager
        .register_service(measurement_service([CharacteristicProp::Read]))
        .await
        .unwrap();

    let indicator = RecordingIndicator {
        sent: RefCell::new(Vec::new()),
    };
    select(gas.run(&indicator), async {
        while indicator.sent.borrow().len() < 1 {
            yield_now().await;
        }
    })
    .await;
    {
        let sent = indicator.sent.borrow();
        assert_eq!(sent.len(), 1);
        // Handles 5..7, little-endian pairs.
        assert_eq!(sent[0], (PEER, 3, vec![0x05, 0x00, 0x07, 0x00]));
    }

    // Unregistering indicates the same range again.
    manager.unregister_service(second).await;
    select(gas.run(&indicator), async {
        while indicator.sent.borrow().len() < 2 {
            yield_now().await;
        }
    })
    .await;
    assert_eq!(
        indicator.sent.borrow()[1],
        (PEER, 3, vec![0x05, 0x00, 0x07, 0x00])
    );
}

#[tokio::test]
async fn service_changed_requires_subscription() {
    let db = TestDb::new();
    let manager = LocalServiceManager::new(&db);
    let gas = GenericAttributeService::register(&manager).await.unwrap();

    // Nobody subscribed: events are consumed without indications.
    manager
        .register_service(measurement_service([CharacteristicProp::Read]))
        .await
        .unwrap();

    let indicator = RecordingIndicator {
        sent: RefCell::new(Vec::new()),
    };
    select(gas.run(&indicator), async {
        for _ in 0..32 {
            yield_now().await;
        }
    })
    .await;
    assert!(indicator.sent.borrow().is_empty());
}

#[tokio::test]
async fn generic_access_service_serves_reads() {
    let db = TestDb::new();
    let manager = LocalServiceManager::new(&db);
    let gap = GenericAccessService::register(&manager, "dev").await.unwrap();
    gap.update_appearance(0x0341);

    // Layout: 1 service declaration, then (declaration, value) pairs for
    // device name, appearance and preferred connection parameters.
    {
        let guard = db.lock().await;
        assert_eq!(
            guard.find_attribute(1).unwrap().value(),
            Some([0x00, 0x18].as_slice())
        );
        assert_eq!(
            guard.find_attribute(3).unwrap().att_type(),
            &Uuid::new_short(0x2a00)
        );
        assert_eq!(
            guard.find_attribute(5).unwrap().att_type(),
            &Uuid::new_short(0x2a01)
        );
        assert_eq!(
            guard.find_attribute(7).unwrap().att_type(),
            &Uuid::new_short(0x2a04)
        );
    }

    let link = TestLink::new();
    let server = AttributeServer::new(&db, link.bearer(), PEER);
    let mut app = AppHandler::default();
    let mut handler = manager.handler(PEER, gap.wrap(&mut app));

    let rsp = request(&server, &mut handler, &[0x0a, 0x03, 0x00]).await;
    assert_eq!(rsp.unwrap(), [0x0b, b'd', b'e', b'v']);

    let rsp = request(&server, &mut handler, &[0x0a, 0x05, 0x00]).await;
    assert_eq!(rsp.unwrap(), [0x0b, 0x41, 0x03]);

    // No parameters configured yet.
    let rsp = request(&server, &mut handler, &[0x0a, 0x07, 0x00]).await;
    assert_eq!(rsp.unwrap(), [0x01, 0x0a, 0x07, 0x00, 0x02]);

    assert!(gap.update_preferred_connection_parameters(Some(
        PreferredConnectionParameters {
            min_interval: 0x0010,
            max_interval: 0x0020,
            max_latency: 4,
            supervision_timeout: 0x00c8,
        }
    )));
    let rsp = request(&server, &mut handler, &[0x0a, 0x07, 0x00]).await;
    assert_eq!(
        rsp.unwrap(),
        [0x0b, 0x10, 0x00, 0x20, 0x00, 0x04, 0x00, 0xc8, 0x00]
    );

    // Writes are refused by the attribute permissions.
    let rsp = request(&server, &mut handler, &[0x12, 0x03, 0x00, 0x61]).await;
    assert_eq!(rsp.unwrap(), [0x01, 0x12, 0x03, 0x00, 0x03]);

    // The wrapper never bothers the application for this service.
    drop(handler);
    assert!(app.reads.is_empty());
}

#[tokio::test]
async fn generic_access_validates_connection_parameters() {
    let db = TestDb::new();
    let manager = LocalServiceManager::new(&db);
    let gap = GenericAccessService::register(&manager, "dev").await.unwrap();

    // Interval below the valid range.
    assert!(!gap.update_preferred_connection_parameters(Some(
        PreferredConnectionParameters {
            min_interval: 0x0005,
            max_interval: 0x0020,
            max_latency: 0,
            supervision_timeout: 0x00c8,
        }
    )));
    // Maximum below minimum.
    assert!(!gap.update_preferred_connection_parameters(Some(
        PreferredConnectionParameters {
            min_interval: 0x0020,
            max_interval: 0x0010,
            max_latency: 0,
            supervision_timeout: 0x00c8,
        }
    )));
    // Latency out of range.
    assert!(!gap.update_preferred_connection_parameters(Some(
        PreferredConnectionParameters {
            min_interval: 0x0010,
            max_interval: 0x0020,
            max_latency: 0x01f4,
            supervision_timeout: 0x00c8,
        }
    )));
    // Unspecified fields are accepted.
    assert!(gap.update_preferred_connection_parameters(Some(
        PreferredConnectionParameters {
            min_interval: 0xffff,
            max_interval: 0xffff,
            max_latency: 0,
            supervision_timeout: 0xffff,
        }
    )));
    // Clearing always works.
    assert!(gap.update_preferred_connection_parameters(None));
}

#[tokio::test]
async fn generic_access_truncates_long_names() {
    let db = TestDb::new();
    let manager = LocalServiceManager::new(&db);
    let gap = GenericAccessService::register(&manager, "dev").await.unwrap();

    let long = "x".repeat(300);
    gap.update_device_name(long.as_bytes());

    let link = TestLink::new();
    let server = AttributeServer::new(&db, link.bearer(), PEER);
    let mut app = AppHandler::default();
    let mut handler = manager.handler(PEER, gap.wrap(&mut app));

    // Bump the MTU so more than one blob fits, then read with offsets.
    request(&server, &mut handler, &[0x02, 0xf7, 0x00]).await;
    let rsp = request(&server, &mut handler, &[0x0a, 0x03, 0x00]).await.unwrap();
    assert_eq!(rsp.len(), 247);

    // A blob read past the start is refused: the value is served whole.
    let rsp = request(&server, &mut handler, &[0x0c, 0x03, 0x00, 0xf6, 0x00]).await;
    assert_eq!(rsp.unwrap(), [0x01, 0x0c, 0x03, 0x00, 0x07]);

    assert!(gap.unregister().await);
    let rsp = request(&server, &mut handler, &[0x0a, 0x03, 0x00]).await;
    assert_eq!(rsp.unwrap(), [0x01, 0x0a, 0x03, 0x00, 0x01]);
}

#[tokio::test]
async fn gas_drops_disconnected_subscribers() {
    let db = TestDb::new();
    let manager = LocalServiceManager::new(&db);
    let gas = GenericAttributeService::register(&manager).await.unwrap();

    let link = TestLink::new();
    let server = AttributeServer::new(&db, link.bearer(), PEER);
    let mut app = AppHandler::default();
    let mut handler = manager.handler(PEER, gas.wrap(&mut app));
    request(&server, &mut handler, &[0x12, 0x04, 0x00, 0x02, 0x00]).await;
    drop(handler);

    gas.disconnect_client(PEER);
    manager.disconnect_client(PEER);

    manager
        .register_service(measurement_service([CharacteristicProp::Read]))
        .await
        .unwrap();

    let indicator = RecordingIndicator {
        sent: RefCell::new(Vec::new()),
    };
    select(gas.run(&indicator), async {
        for _ in 0..32 {
            yield_now().await;
        }
    })
    .await;
    assert!(indicator.sent.borrow().is_empty());
}
