use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use log::trace;

use crate::permissions::{PermissionLauncher, RationaleShower};
use crate::session::{BluetoothAdapterFacade, HidConnector};
use crate::{DeviceHandle, ScannedDevice};

/// One recorded call against a `FakeAdapter`, in invocation order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdapterCall {
    RequestEnable,
    StartDiscovery,
    CancelDiscovery,
    RequestBonding(DeviceHandle),
    SetPin(DeviceHandle, Vec<u8>),
}

/// An adapter that accepts everything by default and records each call.
/// The `set_*` knobs let tests script platform refusals.
pub struct FakeAdapter {
    available: AtomicBool,
    enabled: AtomicBool,
    discovery_accepted: AtomicBool,
    bonding_accepted: AtomicBool,
    pin_accepted: AtomicBool,
    bonded: Mutex<Vec<ScannedDevice>>,
    calls: Mutex<Vec<AdapterCall>>,
}

impl FakeAdapter {
    pub fn new() -> Self {
        Self { available: AtomicBool::new(true),
               enabled: AtomicBool::new(true),
               discovery_accepted: AtomicBool::new(true),
               bonding_accepted: AtomicBool::new(true),
               pin_accepted: AtomicBool::new(true),
               bonded: Mutex::new(vec![]),
               calls: Mutex::new(vec![]) }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn set_discovery_accepted(&self, accepted: bool) {
        self.discovery_accepted.store(accepted, Ordering::SeqCst);
    }

    pub fn set_bonding_accepted(&self, accepted: bool) {
        self.bonding_accepted.store(accepted, Ordering::SeqCst);
    }

    pub fn set_pin_accepted(&self, accepted: bool) {
        self.pin_accepted.store(accepted, Ordering::SeqCst);
    }

    pub fn add_bonded(&self, device: ScannedDevice) {
        self.bonded.lock().unwrap().push(device);
    }

    pub fn calls(&self) -> Vec<AdapterCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: AdapterCall) {
        trace!("Fake adapter: {:?}", call);
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl BluetoothAdapterFacade for FakeAdapter {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    async fn request_enable(&self) {
        self.record(AdapterCall::RequestEnable);
    }

    async fn start_discovery(&self) -> bool {
        self.record(AdapterCall::StartDiscovery);
        self.discovery_accepted.load(Ordering::SeqCst)
    }

    async fn cancel_discovery(&self) {
        self.record(AdapterCall::CancelDiscovery);
    }

    async fn bonded_devices(&self) -> Vec<ScannedDevice> {
        self.bonded.lock().unwrap().clone()
    }

    async fn request_bonding(&self, device: DeviceHandle) -> bool {
        self.record(AdapterCall::RequestBonding(device));
        self.bonding_accepted.load(Ordering::SeqCst)
    }

    async fn set_pin(&self, device: DeviceHandle, pin: &[u8]) -> bool {
        self.record(AdapterCall::SetPin(device, pin.to_vec()));
        self.pin_accepted.load(Ordering::SeqCst)
    }
}

/// A permission launcher where nothing is granted until a test says so.
/// Requests are only recorded; tests deliver the outcome themselves through
/// the coordinator's result callback.
pub struct FakeLauncher {
    granted: Mutex<HashSet<String>>,
    rationale: Mutex<HashSet<String>>,
    requests: Mutex<Vec<String>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self { granted: Mutex::new(HashSet::new()),
               rationale: Mutex::new(HashSet::new()),
               requests: Mutex::new(vec![]) }
    }

    pub fn grant(&self, permission: &str) {
        self.granted.lock().unwrap().insert(permission.to_string());
    }

    /// Makes `should_show_rationale` answer true for `permission`, as the
    /// platform does after a previous denial.
    pub fn recommend_rationale(&self, permission: &str) {
        self.rationale.lock().unwrap().insert(permission.to_string());
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl PermissionLauncher for FakeLauncher {
    fn is_granted(&self, permission: &str) -> bool {
        self.granted.lock().unwrap().contains(permission)
    }

    fn should_show_rationale(&self, permission: &str) -> bool {
        self.rationale.lock().unwrap().contains(permission)
    }

    fn request(&self, permission: &str) {
        self.requests.lock().unwrap().push(permission.to_string());
    }
}

/// A rationale prompt answered instantly with a fixed choice.
pub struct FakeRationale {
    accept: bool,
    shown: Mutex<Vec<String>>,
}

impl FakeRationale {
    pub fn accepting() -> Self {
        Self { accept: true,
               shown: Mutex::new(vec![]) }
    }

    pub fn refusing() -> Self {
        Self { accept: false,
               shown: Mutex::new(vec![]) }
    }

    /// The rationale texts shown so far.
    pub fn shown(&self) -> Vec<String> {
        self.shown.lock().unwrap().clone()
    }
}

impl RationaleShower for FakeRationale {
    fn show_rationale_with_action(&self, rationale: &str, callback: Box<dyn FnOnce(bool) + Send>) {
        self.shown.lock().unwrap().push(rationale.to_string());
        callback(self.accept);
    }
}

/// An HID connector recording each profile connect.
pub struct FakeHid {
    accept: AtomicBool,
    connects: Mutex<Vec<ScannedDevice>>,
}

impl FakeHid {
    pub fn new() -> Self {
        Self { accept: AtomicBool::new(true),
               connects: Mutex::new(vec![]) }
    }

    pub fn set_accepted(&self, accepted: bool) {
        self.accept.store(accepted, Ordering::SeqCst);
    }

    pub fn connected(&self) -> Vec<ScannedDevice> {
        self.connects.lock().unwrap().clone()
    }
}

impl HidConnector for FakeHid {
    fn connect_profile(&self, device: &ScannedDevice) -> bool {
        self.connects.lock().unwrap().push(device.clone());
        self.accept.load(Ordering::SeqCst)
    }
}
