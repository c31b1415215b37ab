use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{FutureExt, Stream, StreamExt};
use log::{debug, trace, warn};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::hid;
use crate::pairing::{PairingCoordinator, PinStrategy};
use crate::permissions::{perms, BoxOperation, PermissionCoordinator, PermissionLauncher,
                         RationaleShower};
use crate::scan::ScanTracker;
use crate::{BroadcastEvent, DeviceHandle, Event, Result, ScannedDevice};

/// The platform Bluetooth adapter surface this crate depends on. Discovery
/// state and the adapter itself are process-wide singletons on the
/// platform; the host wraps them once and hands the wrapper in through
/// `SessionConfig`.
#[async_trait]
pub trait BluetoothAdapterFacade: Send + Sync {
    /// Whether the device has a usable Bluetooth radio at all.
    fn is_available(&self) -> bool;

    async fn is_enabled(&self) -> bool;

    /// Fires the platform's enable-Bluetooth prompt; the outcome arrives
    /// later as an adapter-state-changed broadcast.
    async fn request_enable(&self);

    /// Returns false when the platform refuses to start discovery.
    async fn start_discovery(&self) -> bool;

    async fn cancel_discovery(&self);

    async fn bonded_devices(&self) -> Vec<ScannedDevice>;

    /// Returns false when the platform refuses to initiate bonding.
    async fn request_bonding(&self, device: DeviceHandle) -> bool;

    /// Supplies PIN material for an in-flight pairing challenge.
    async fn set_pin(&self, device: DeviceHandle, pin: &[u8]) -> bool;
}

/// The HID-profile connect primitive, invoked once a device is bonded.
/// Opaque to this crate (on Android it hides a pile of reflection).
pub trait HidConnector: Send + Sync {
    fn connect_profile(&self, device: &ScannedDevice) -> bool;
}

static PERMISSION_RATIONALES: &[(&str, &str)] = &[
    (perms::BLUETOOTH_CONNECT, "Connecting to a Wiimote needs the Bluetooth connect permission."),
    (perms::BLUETOOTH_SCAN, "Finding nearby Wiimotes needs the Bluetooth scan permission."),
    (perms::BLUETOOTH_ADMIN, "Managing Bluetooth discovery needs the Bluetooth admin permission."),
    (perms::ACCESS_FINE_LOCATION, "Bluetooth discovery needs the fine location permission."),
    (perms::ACCESS_COARSE_LOCATION, "Bluetooth discovery needs the coarse location permission."),
    (perms::BLUETOOTH_PRIVILEGED, "Pairing with a Wiimote needs Bluetooth privileges."),
];

// Discovery needs this whole set granted on recent Android versions.
static DISCOVERY_PERMISSIONS: &[&str] = &[perms::BLUETOOTH_ADMIN,
                                          perms::BLUETOOTH_CONNECT,
                                          perms::BLUETOOTH_SCAN,
                                          perms::ACCESS_FINE_LOCATION,
                                          perms::ACCESS_COARSE_LOCATION];

pub struct SessionConfig {
    adapter: Arc<dyn BluetoothAdapterFacade>,
    permission_launcher: Arc<dyn PermissionLauncher>,
    rationale_shower: Arc<dyn RationaleShower>,
    hid: Arc<dyn HidConnector>,
    pin_strategy: PinStrategy,
    runtime_permission_checks: bool,
}

impl SessionConfig {
    pub fn new(adapter: Arc<dyn BluetoothAdapterFacade>,
               permission_launcher: Arc<dyn PermissionLauncher>,
               rationale_shower: Arc<dyn RationaleShower>,
               hid: Arc<dyn HidConnector>)
               -> Self {
        Self { adapter,
               permission_launcher,
               rationale_shower,
               hid,
               pin_strategy: PinStrategy::DeviceAddress,
               runtime_permission_checks: true }
    }

    /// Default PIN derivation for `connect` calls that don't ask for
    /// sync-button pairing.
    pub fn set_pin_strategy(&mut self, strategy: PinStrategy) -> &mut Self {
        self.pin_strategy = strategy;
        self
    }

    /// Set false on platform versions whose permission model predates the
    /// runtime Bluetooth permissions; every gate then bypasses straight to
    /// its operation.
    pub fn set_runtime_permission_checks(&mut self, enabled: bool) -> &mut Self {
        self.runtime_permission_checks = enabled;
        self
    }

    pub async fn start(self) -> Result<Session> {
        Session::start(self).await
    }
}

/// The top-level coordinator pairing an Android host with Wiimotes.
///
/// Owns one PermissionCoordinator, one ScanTracker and one
/// PairingCoordinator and forwards between them; the host's platform glue
/// feeds broadcasts in through `dispatch` and permission results through
/// `on_permission_result`, and observes progress on the `events` stream.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}
impl Deref for Session {
    type Target = SessionInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

pub struct SessionInner {
    // The public-facing event stream
    event_bus: broadcast::Sender<Event>,

    adapter: Arc<dyn BluetoothAdapterFacade>,
    rationale_shower: Arc<dyn RationaleShower>,

    permissions: PermissionCoordinator,
    scan: ScanTracker,
    pairing: PairingCoordinator,

    pin_strategy: PinStrategy,
    runtime_permission_checks: bool,

    // Single-shot: armed when a scan was requested while the adapter was
    // off, consumed by the next off->on adapter-state edge
    scan_pending_on_enable: AtomicBool,
}

impl Session {
    // In situations where we need to pass a reference to the Session into a
    // deferred job but must avoid creating a circular reference (jobs sit in
    // registries the Session itself owns) we share a Weak<SessionInner> and
    // upgrade + re`wrap()` it when the job actually runs.
    fn wrap(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    async fn start(config: SessionConfig) -> Result<Session> {
        let (event_bus, _) = broadcast::channel(16);

        let permissions = PermissionCoordinator::new(config.permission_launcher.clone());
        for (permission, rationale) in PERMISSION_RATIONALES {
            permissions.configure(permission, rationale);
        }

        let scan = ScanTracker::new();
        let pairing = PairingCoordinator::new(config.adapter.clone(),
                                              config.hid.clone(),
                                              permissions.clone(),
                                              config.runtime_permission_checks);

        Ok(Session::wrap(Arc::new(SessionInner {
            event_bus,
            adapter: config.adapter,
            rationale_shower: config.rationale_shower,
            permissions,
            scan,
            pairing,
            pin_strategy: config.pin_strategy,
            runtime_permission_checks: config.runtime_permission_checks,
            scan_pending_on_enable: AtomicBool::new(false),
        })))
    }

    pub fn has_bluetooth(&self) -> bool {
        self.adapter.is_available()
    }

    pub fn permissions(&self) -> &PermissionCoordinator {
        &self.permissions
    }

    pub fn pairing(&self) -> &PairingCoordinator {
        &self.pairing
    }

    pub fn scan_tracker(&self) -> &ScanTracker {
        &self.scan
    }

    /// Returns a stream of session events: scan result updates, scan end
    /// notifications and adapter on/off edges.
    pub fn events(&self) -> Result<impl Stream<Item = Event>> {
        let receiver = self.event_bus.subscribe();
        Ok(BroadcastStream::new(receiver).filter_map(|x| async move {
                                             if let Ok(x) = x {
                                                 Some(x)
                                             } else {
                                                 None
                                             }
                                         }))
    }

    fn bypass(&self) -> impl Fn() -> bool + Send {
        let runtime_checks = self.runtime_permission_checks;
        move || !runtime_checks
    }

    fn bypass_arc(&self) -> Arc<dyn Fn() -> bool + Send + Sync> {
        let runtime_checks = self.runtime_permission_checks;
        Arc::new(move || !runtime_checks)
    }

    /// Boundary callback for platform permission request results.
    pub async fn on_permission_result(&self, permission: &str, granted: bool) {
        self.permissions.on_permission_result(permission, granted).await;
    }

    /// Kicks off a discovery scan for Wiimotes, acquiring the connect
    /// permission first and asking the user to enable Bluetooth if the
    /// adapter is off (the scan then starts on the enabled edge).
    pub async fn try_start_scan(&self) -> Option<()> {
        let weak_session = Arc::downgrade(&self.inner);
        self.permissions
            .run_gated(perms::BLUETOOTH_CONNECT,
                       self.rationale_shower.clone(),
                       self.bypass(),
                       move || async move {
                           let session = match weak_session.upgrade() {
                               Some(strong_inner) => Session::wrap(strong_inner),
                               None => return,
                           };
                           if session.adapter.is_enabled().await {
                               debug!("Bluetooth is enabled, starting discovery");
                               session.start_discovery().await;
                           } else {
                               debug!("Bluetooth is not enabled, requesting before starting \
                                       discovery");
                               session.scan_pending_on_enable.store(true, Ordering::SeqCst);
                               session.adapter.request_enable().await;
                           }
                       })
            .await
    }

    /// Pairs with `device` if necessary and connects its HID profile.
    /// `sync_pairing` selects the sync-button PIN; otherwise the session's
    /// configured strategy applies. Every failure mode surfaces as `None`
    /// plus a log line; retrying is the caller's call.
    pub async fn connect(&self, device: &ScannedDevice, sync_pairing: bool) -> Option<()> {
        let strategy = if sync_pairing {
            PinStrategy::SyncButton
        } else {
            self.pin_strategy
        };
        self.pairing
            .connect(device, strategy, self.rationale_shower.clone())
            .await
    }

    async fn start_discovery(&self) {
        // Bonded Wiimotes won't advertise during discovery, so surface them
        // straight away.
        if let Some(bonded) = self.pairing
                                  .bonded_devices(self.rationale_shower.clone())
                                  .await
        {
            let mut seeded = false;
            for device in bonded {
                if hid::device_name_is_wiimote(&device.name) {
                    self.scan.scan_found(device);
                    seeded = true;
                }
            }
            if seeded {
                let wiimotes = self.scan.currently_found().await;
                let _ = self.event_bus.send(Event::ScanResults { wiimotes });
            }
        }

        let weak_session = Arc::downgrade(&self.inner);
        let operation: BoxOperation<()> = Box::new(move || {
            async move {
                let session = match weak_session.upgrade() {
                    Some(strong_inner) => Session::wrap(strong_inner),
                    None => return,
                };
                debug!("Starting bluetooth discovery");
                if session.adapter.start_discovery().await {
                    debug!("Bluetooth discovery successfully started");
                } else {
                    warn!("Bluetooth discovery failed to start");
                    let _ = session.event_bus.send(Event::ScanEnded);
                }
            }
            .boxed()
        });
        self.permissions
            .run_gated_multi(DISCOVERY_PERMISSIONS.iter().map(|p| p.to_string()).collect(),
                             self.rationale_shower.clone(),
                             self.bypass_arc(),
                             operation)
            .await;
    }

    /// The dispatch contract: translates each platform broadcast into calls
    /// against the coordinators. The host's broadcast receiver glue calls
    /// this for every Bluetooth intent it registered for.
    pub async fn dispatch(&self, event: BroadcastEvent) {
        match event {
            BroadcastEvent::DeviceFound(device) => {
                trace!("Scan found device {:?}", device);
                if !device.name.is_empty() && hid::device_name_is_wiimote(&device.name) {
                    debug!("Found Wiimote {:?}", device);
                    self.scan.scan_found(device);
                    let wiimotes = self.scan.currently_found().await;
                    let _ = self.event_bus.send(Event::ScanResults { wiimotes });
                }
            }
            BroadcastEvent::DiscoveryStarted => {
                debug!("Bluetooth scan started");
                self.scan.start_scan();
            }
            BroadcastEvent::DiscoveryFinished => {
                let found = self.scan.end_scan().await;
                debug!("Bluetooth scan ended, found {:?}", found);
                self.pairing.on_discovery_finished().await;
                let _ = self.event_bus.send(Event::ScanResults { wiimotes: found });
                let _ = self.event_bus.send(Event::ScanEnded);
            }
            BroadcastEvent::AdapterStateChanged { previous_on, now_on } => {
                if !previous_on && now_on {
                    debug!("Bluetooth got enabled");
                    if self.scan_pending_on_enable.swap(false, Ordering::SeqCst) {
                        debug!("User enabled bluetooth, starting discovery");
                        self.start_discovery().await;
                    }
                    let _ = self.event_bus.send(Event::AdapterStateChanged { enabled: true });
                } else if previous_on && !now_on {
                    debug!("Bluetooth got disabled");
                    let _ = self.event_bus.send(Event::AdapterStateChanged { enabled: false });
                }
            }
            BroadcastEvent::PairingRequest { device } => {
                self.pairing.on_pairing_request(&device).await;
            }
            BroadcastEvent::BondStateChanged { device, previous, new } => {
                self.pairing.on_bond_state_changed(&device, previous, new).await;
            }
            BroadcastEvent::ServiceUuids { device, uuids } => {
                self.pairing.on_service_uuids(&device, &uuids).await;
            }
        }
    }
}
