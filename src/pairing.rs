use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use lazy_static::lazy_static;
use log::{debug, warn};
use uuid::Uuid;

use crate::jobs::{noop_task, JobRegistry, JobTask};
use crate::permissions::{perms, PermissionCoordinator, RationaleShower};
use crate::session::{BluetoothAdapterFacade, HidConnector};
use crate::{Address, BondState, Error, ScannedDevice};

/// Timeout bound for each awaited pairing sub-step (the pairing-request PIN
/// exchange and the bond-state resolution).
pub const PAIRING_STEP_TIMEOUT: Duration = Duration::from_secs(60);

/// How long to wait for the platform to report that an in-flight discovery
/// scan has been torn down before connecting anyway.
pub const DISCOVERY_CANCEL_TIMEOUT: Duration = Duration::from_secs(20);

lazy_static! {
    // The host address Wiimotes are told to pair against when the user
    // holds the red sync button instead of pressing 1+2.
    static ref SYNC_PAIRING_ADDRESS: Address =
        Address::from_str("8C:DE:E6:70:6C:88").unwrap();
}

/// How the pairing PIN is derived when the platform challenges us during
/// bonding. Wiimote PINs are always the six octets of some MAC address in
/// reverse transmission order; the strategies differ on whose address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PinStrategy {
    /// Derive from the fixed host address recognised in sync-button pairing
    /// mode.
    SyncButton,
    /// Derive from the target device's own address (1+2 button pairing).
    DeviceAddress,
}

impl PinStrategy {
    pub fn derive_pin(self, target: &Address) -> Option<Vec<u8>> {
        let source = match self {
            PinStrategy::SyncButton => &*SYNC_PAIRING_ADDRESS,
            PinStrategy::DeviceAddress => target,
        };
        address_pin_bytes(source)
    }
}

/// Reduces an address to its six octets, reversed, which is the PIN material
/// Wiimotes expect. `None` for addresses that aren't MAC48.
fn address_pin_bytes(address: &Address) -> Option<Vec<u8>> {
    match address {
        Address::MAC(mac) => {
            let mut bytes = mac.octets().to_vec();
            bytes.reverse();
            Some(bytes)
        }
        Address::String(_) => None,
    }
}

/// Formats PIN bytes the way addresses are logged.
pub(crate) fn pin_str(pin: &[u8]) -> String {
    pin.iter()
       .map(|byte| format!("{:02X}", byte))
       .collect::<Vec<_>>()
       .join(":")
}

/// Final outcome of a bonding attempt, derived from bond-state-change
/// broadcasts correlated by device address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BondOutcome {
    Bonded,
    Unbonded,
    TimedOut,
}

/// Orchestrates device bonding: cancels in-flight discovery, initiates
/// platform bonding, answers the pairing PIN challenge and awaits the
/// bond-state resolution, then hands the bonded device to the HID connect
/// primitive.
///
/// Cheaply clonable; all clones share the same job registries.
#[derive(Clone)]
pub struct PairingCoordinator {
    inner: Arc<PairingCoordinatorInner>,
}

struct PairingCoordinatorInner {
    adapter: Arc<dyn BluetoothAdapterFacade>,
    hid: Arc<dyn HidConnector>,
    permissions: PermissionCoordinator,
    runtime_permission_checks: bool,

    // Waits keyed on the scan-active flag, resolved when discovery ends
    scan_ended_jobs: JobRegistry<bool, (), bool>,

    // Waits keyed by device address. Kept as separate registries since their
    // keys live in different semantic domains even when the key type matches.
    pairing_request_jobs: JobRegistry<String, Option<Vec<u8>>, bool>,
    bond_status_jobs: JobRegistry<String, (), bool>,
    sdp_uuid_jobs: JobRegistry<String, (), Vec<Uuid>>,
}

impl PairingCoordinator {
    pub fn new(adapter: Arc<dyn BluetoothAdapterFacade>,
               hid: Arc<dyn HidConnector>,
               permissions: PermissionCoordinator,
               runtime_permission_checks: bool)
               -> Self {
        Self { inner: Arc::new(PairingCoordinatorInner { adapter,
                                                         hid,
                                                         permissions,
                                                         runtime_permission_checks,
                                                         scan_ended_jobs: JobRegistry::new(),
                                                         pairing_request_jobs: JobRegistry::new(),
                                                         bond_status_jobs: JobRegistry::new(),
                                                         sdp_uuid_jobs: JobRegistry::new() }) }
    }

    fn bypass(&self) -> impl Fn() -> bool + Send {
        let runtime_checks = self.inner.runtime_permission_checks;
        move || !runtime_checks
    }

    /// Pairs with `device` if necessary and connects its HID profile.
    ///
    /// Gated on the connect permission. Any failure along the way (denied
    /// permission, platform rejection, pairing timeout, HID connect refusal)
    /// yields `None` with the detail only observable in the logs; the caller
    /// may retry by calling `connect` again.
    pub async fn connect(&self,
                         device: &ScannedDevice,
                         strategy: PinStrategy,
                         rationale_shower: Arc<dyn RationaleShower>)
                         -> Option<()> {
        let this = self.clone();
        let target = device.clone();
        let shower = rationale_shower.clone();
        self.inner
            .permissions
            .run_gated(perms::BLUETOOTH_CONNECT,
                       rationale_shower,
                       self.bypass(),
                       move || async move { this.connect_gated(target, strategy, shower).await })
            .await
            .flatten()
    }

    async fn connect_gated(&self,
                           device: ScannedDevice,
                           strategy: PinStrategy,
                           rationale_shower: Arc<dyn RationaleShower>)
                           -> Option<()> {
        // Discovery starves the baseband; tear it down before connecting.
        // Best-effort: if the platform never reports the teardown we
        // proceed regardless after the timeout.
        let scan_end = self.inner.scan_ended_jobs.register_job(true, noop_task());
        self.inner.adapter.cancel_discovery().await;
        if scan_end.await_result(DISCOVERY_CANCEL_TIMEOUT).await.is_err() {
            debug!("Timed out waiting for discovery to cancel, connecting anyway");
        }

        let bonded = self.bonded_devices(rationale_shower).await.unwrap_or_default();
        let already_bonded = bonded.iter().any(|d| d.address == device.address);

        if already_bonded {
            debug!("Device {:?} is already bonded, connecting", device.name);
        } else {
            debug!("Device {:?} isn't bonded, pairing first", device.name);
            if let Err(err) = self.pair_device(&device, strategy).await {
                warn!("Pairing with {:?} failed: {}", device.name, err);
                return None;
            }
        }

        if self.inner.hid.connect_profile(&device) {
            Some(())
        } else {
            // No retry here; the caller owns the retry policy
            warn!("HID profile connect failed for {:?}", device.name);
            None
        }
    }

    /// The platform's set of bonded devices; itself gated on the connect
    /// permission.
    pub async fn bonded_devices(&self,
                                rationale_shower: Arc<dyn RationaleShower>)
                                -> Option<Vec<ScannedDevice>> {
        let adapter = self.inner.adapter.clone();
        self.inner
            .permissions
            .run_gated(perms::BLUETOOTH_CONNECT,
                       rationale_shower,
                       self.bypass(),
                       move || async move { adapter.bonded_devices().await })
            .await
    }

    async fn pair_device(&self,
                         device: &ScannedDevice,
                         strategy: PinStrategy)
                         -> Result<(), Error> {
        let address = device.address.clone();
        let key = address.to_string();

        // Both waits have to be registered before bonding is triggered, or
        // a fast platform could raise the events before anyone listens.
        let pin_task: JobTask<Option<Vec<u8>>> =
            Box::new(move || async move { strategy.derive_pin(&address) }.boxed());
        let pin_job = self.inner
                          .pairing_request_jobs
                          .register_job(key.clone(), pin_task);
        let bond_job = self.inner.bond_status_jobs.register_job(key, noop_task());

        if !self.inner.adapter.request_bonding(device.handle).await {
            return Err(Error::PlatformRejected("bonding"));
        }
        debug!("Pairing with device {:?} started", device.name);

        let pinned = pin_job.await_result(PAIRING_STEP_TIMEOUT).await;
        debug!("Is device {:?} pinned? {:?}", device.name, pinned);
        // Ok(false) means the pairing request arrived and the PIN was
        // refused (underivable, or rejected by the platform); the bond can
        // only fail at that point. A timeout is not conclusive: some
        // bondings never raise a pairing request at all.
        if let Ok(false) = pinned {
            return Err(Error::PlatformRejected("pin"));
        }

        let outcome = match bond_job.await_result(PAIRING_STEP_TIMEOUT).await {
            Ok(true) => BondOutcome::Bonded,
            Ok(false) => BondOutcome::Unbonded,
            Err(_) => BondOutcome::TimedOut,
        };
        debug!("Bond outcome for device {:?}: {:?}", device.name, outcome);

        match outcome {
            BondOutcome::Bonded => Ok(()),
            BondOutcome::Unbonded => Err(Error::PlatformRejected("pairing")),
            BondOutcome::TimedOut => Err(Error::Timeout("bond state change")),
        }
    }

    /// Registers a wait for the platform's SDP service-discovery result for
    /// `device` and suspends until the UUID list arrives or `timeout`
    /// expires.
    pub async fn await_service_uuids(&self,
                                     device: &ScannedDevice,
                                     timeout: Duration)
                                     -> Option<Vec<Uuid>> {
        let handle = self.inner
                         .sdp_uuid_jobs
                         .register_job(device.address.to_string(), noop_task());
        handle.await_result(timeout).await.ok()
    }

    pub(crate) async fn on_discovery_finished(&self) {
        for job in self.inner.scan_ended_jobs.consume_jobs(true).await {
            let ((), resolver) = job.run().await;
            resolver.resolve(true);
        }
    }

    /// The platform challenged us for a PIN while bonding with `device`:
    /// run each parked job's PIN derivation and feed the PIN to the
    /// platform. A missing PIN (or a platform refusing it) denies pairing.
    pub(crate) async fn on_pairing_request(&self, device: &ScannedDevice) {
        let jobs = self.inner
                       .pairing_request_jobs
                       .consume_jobs(device.address.to_string())
                       .await;
        for job in jobs {
            let (pin, resolver) = job.run().await;
            match pin {
                Some(pin) => {
                    if self.inner.adapter.set_pin(device.handle, &pin).await {
                        debug!("Pin set for device {:?}, pin={}", device.name, pin_str(&pin));
                        resolver.resolve(true);
                    } else {
                        warn!("Platform rejected pin for device {:?}", device.name);
                        resolver.resolve(false);
                    }
                }
                None => {
                    warn!("Invalid pairing pin for device {:?}, denying pairing", device.name);
                    resolver.resolve(false);
                }
            }
        }
    }

    /// Resolves bond-status waits for `device` on a transition into or out
    /// of the bonded state. Intermediate transitions (e.g. none -> bonding)
    /// leave the waits parked.
    pub(crate) async fn on_bond_state_changed(&self,
                                              device: &ScannedDevice,
                                              previous: BondState,
                                              new: BondState) {
        let bonded = previous != BondState::Bonded && new == BondState::Bonded;
        let unbonded = previous != BondState::None && new == BondState::None;
        if bonded || unbonded {
            let jobs = self.inner
                           .bond_status_jobs
                           .consume_jobs(device.address.to_string())
                           .await;
            for job in jobs {
                let ((), resolver) = job.run().await;
                resolver.resolve(bonded);
            }
        }
        debug!("Bond state for device {:?} changed from {:?} to {:?}",
               device.name, previous, new);
    }

    pub(crate) async fn on_service_uuids(&self, device: &ScannedDevice, uuids: &[Uuid]) {
        let jobs = self.inner
                       .sdp_uuid_jobs
                       .consume_jobs(device.address.to_string())
                       .await;
        for job in jobs {
            job.resolve(uuids.to_vec());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_address_pin_is_reversed_octets() {
        let address = Address::from_str("00:1F:32:98:12:AB").unwrap();
        let pin = PinStrategy::DeviceAddress.derive_pin(&address);
        assert_eq!(pin, Some(vec![0xAB, 0x12, 0x98, 0x32, 0x1F, 0x00]));
    }

    #[test]
    fn sync_button_pin_ignores_the_target_address() {
        let address = Address::from_str("00:1F:32:98:12:AB").unwrap();
        let pin = PinStrategy::SyncButton.derive_pin(&address);
        assert_eq!(pin, Some(vec![0x88, 0x6C, 0x70, 0xE6, 0xDE, 0x8C]));
    }

    #[test]
    fn non_mac_addresses_yield_no_pin() {
        let address = Address::from_str("18c2a267-a539-4423-aecc-edeeb2784bcc").unwrap();
        assert_eq!(PinStrategy::DeviceAddress.derive_pin(&address), None);
    }

    #[test]
    fn pins_format_like_addresses() {
        assert_eq!(pin_str(&[0x88, 0x6C, 0x70]), "88:6C:70");
    }
}
