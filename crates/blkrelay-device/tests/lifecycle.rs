use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use blkrelay_backing::{
    completion_channel, BackingIo, BackingStore, Completion, IoStatus, MemBacking, SECTOR_SIZE,
};
use blkrelay_device::{
    CreateError, DeviceConfig, DeviceRegistry, DeviceTable, IoRequest, RegistryError, RelayDevice,
    SubmitLimits,
};

const WAIT: Duration = Duration::from_secs(5);

fn create_mem_device(name: &str, sectors: u64, table: &Arc<DeviceTable>) -> Arc<RelayDevice> {
    RelayDevice::create_with_backing(
        name.to_owned(),
        Box::new(MemBacking::new(sectors)),
        SubmitLimits::default(),
        table.clone(),
    )
    .unwrap()
}

#[test]
fn created_device_mirrors_backing_capacity_and_registers() {
    let table = Arc::new(DeviceTable::new());
    let device = create_mem_device("relay0", 2048, &table);

    assert_eq!(device.capacity_sectors(), 2048);
    assert_eq!(device.in_flight(), 1);
    assert!(!device.is_deleting());
    assert!(table.lookup("relay0").is_some());
    assert_eq!(table.names(), vec!["relay0".to_owned()]);

    let (done, waiter) = completion_channel();
    device.submit(IoRequest::write(7, vec![0x33u8; SECTOR_SIZE], done));
    assert!(waiter.wait_timeout(WAIT).unwrap().is_ok());

    let (done, waiter) = completion_channel();
    device.submit(IoRequest::read(7, 1, done));
    let result = waiter.wait_timeout(WAIT).unwrap();
    assert_eq!(result.status, IoStatus::Ok);
    assert_eq!(result.data.unwrap(), vec![0x33u8; SECTOR_SIZE]);

    device.delete();
    assert!(table.is_empty());
}

#[test]
fn file_backed_device_reports_file_capacity() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.as_file().set_len(1024 * 1024).unwrap();

    let table = Arc::new(DeviceTable::new());
    let registry: Arc<dyn DeviceRegistry> = table.clone();
    let device = RelayDevice::create(DeviceConfig::new("relay0", tmp.path()), registry).unwrap();

    assert_eq!(device.capacity_sectors(), 2048);

    let (done, waiter) = completion_channel();
    device.submit(IoRequest::write(100, vec![0x5Au8; 4 * SECTOR_SIZE], done));
    assert!(waiter.wait_timeout(WAIT).unwrap().is_ok());

    let (done, waiter) = completion_channel();
    device.submit(IoRequest::read(100, 4, done));
    let result = waiter.wait_timeout(WAIT).unwrap();
    assert_eq!(result.data.unwrap(), vec![0x5Au8; 4 * SECTOR_SIZE]);

    device.delete();
    assert!(table.is_empty());
}

#[test]
fn create_fails_when_backing_path_is_missing() {
    let dir = tempfile::tempdir().unwrap();
    let table = Arc::new(DeviceTable::new());

    let err = RelayDevice::create(
        DeviceConfig::new("relay0", dir.path().join("absent.img")),
        table.clone() as Arc<dyn DeviceRegistry>,
    )
    .unwrap_err();

    assert!(matches!(err, CreateError::BackingOpen(_)));
    assert!(table.is_empty());
}

#[test]
fn duplicate_name_fails_registration_and_keeps_the_first_device() {
    let table = Arc::new(DeviceTable::new());
    let first = create_mem_device("relay0", 64, &table);

    let err = RelayDevice::create_with_backing(
        "relay0".to_owned(),
        Box::new(MemBacking::new(64)),
        SubmitLimits::default(),
        table.clone(),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        CreateError::Registration(RegistryError::DuplicateName(ref name)) if name == "relay0"
    ));

    // The first device is untouched and still serves requests.
    assert_eq!(table.len(), 1);
    let (done, waiter) = completion_channel();
    first.submit(IoRequest::read(0, 1, done));
    assert!(waiter.wait_timeout(WAIT).unwrap().is_ok());

    first.delete();
    assert!(table.is_empty());
}

struct DropProbe {
    inner: MemBacking,
    dropped: Arc<AtomicBool>,
}

impl BackingStore for DropProbe {
    fn capacity_sectors(&self) -> u64 {
        self.inner.capacity_sectors()
    }

    fn submit(&self, io: BackingIo, done: Completion) {
        self.inner.submit(io, done);
    }
}

impl Drop for DropProbe {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

struct RejectingRegistry;

impl DeviceRegistry for RejectingRegistry {
    fn register(&self, device: &Arc<RelayDevice>) -> Result<(), RegistryError> {
        Err(RegistryError::Rejected {
            name: device.name().to_owned(),
            reason: "no slots".to_owned(),
        })
    }

    fn deregister(&self, _name: &str) {}
}

#[test]
fn registration_failure_releases_the_backing_store() {
    let dropped = Arc::new(AtomicBool::new(false));
    let backing = DropProbe {
        inner: MemBacking::new(64),
        dropped: dropped.clone(),
    };

    let err = RelayDevice::create_with_backing(
        "relay0".to_owned(),
        Box::new(backing),
        SubmitLimits::default(),
        Arc::new(RejectingRegistry),
    )
    .unwrap_err();

    assert!(matches!(
        err,
        CreateError::Registration(RegistryError::Rejected { .. })
    ));
    assert!(dropped.load(Ordering::SeqCst));
}

#[test]
fn backing_is_released_only_when_the_last_handle_drops() {
    let dropped = Arc::new(AtomicBool::new(false));
    let backing = DropProbe {
        inner: MemBacking::new(64),
        dropped: dropped.clone(),
    };
    let table = Arc::new(DeviceTable::new());
    let device = RelayDevice::create_with_backing(
        "relay0".to_owned(),
        Box::new(backing),
        SubmitLimits::default(),
        table.clone(),
    )
    .unwrap();

    device.delete();
    // The caller still holds the device, so the backing stays open.
    assert!(table.is_empty());
    assert!(!dropped.load(Ordering::SeqCst));

    drop(device);
    assert!(dropped.load(Ordering::SeqCst));
}

#[test]
fn delete_deregisters_and_is_idempotent() {
    let table = Arc::new(DeviceTable::new());
    let device = create_mem_device("relay0", 64, &table);

    device.delete();
    assert!(table.lookup("relay0").is_none());
    assert_eq!(device.in_flight(), 0);
    assert!(device.is_deleting());

    // A second delete returns without blocking or underflowing the gate.
    device.delete();
    assert_eq!(device.in_flight(), 0);
}

#[test]
fn deleted_device_rejects_new_requests() {
    let table = Arc::new(DeviceTable::new());
    let device = create_mem_device("relay0", 64, &table);
    device.delete();

    let (done, waiter) = completion_channel();
    device.submit(IoRequest::read(0, 1, done));
    let result = waiter.wait_timeout(WAIT).unwrap();
    assert_eq!(result.status, IoStatus::IoError);
    assert!(result.data.is_none());

    let counters = device.counters();
    assert_eq!(counters.submitted, 0);
    assert_eq!(counters.rejected, 1);
}

#[test]
fn devices_coexist_under_distinct_names() {
    let table = Arc::new(DeviceTable::new());
    let first = create_mem_device("relay0", 64, &table);
    let second = create_mem_device("relay1", 128, &table);

    assert_eq!(table.len(), 2);
    assert_eq!(table.names(), vec!["relay0".to_owned(), "relay1".to_owned()]);
    assert_eq!(table.lookup("relay1").unwrap().capacity_sectors(), 128);

    first.delete();
    assert_eq!(table.len(), 1);
    assert!(table.lookup("relay1").is_some());

    // The survivor still serves requests after its sibling is gone.
    let (done, waiter) = completion_channel();
    second.submit(IoRequest::read(0, 1, done));
    assert!(waiter.wait_timeout(WAIT).unwrap().is_ok());

    second.delete();
    assert!(table.is_empty());
}
