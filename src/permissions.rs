use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, warn};

use crate::jobs::{JobRegistry, JobTask};

/// How long a gated operation waits for the user to answer a platform
/// permission dialog before giving up.
pub const PERMISSION_GRANT_TIMEOUT: Duration = Duration::from_secs(20);

/// Android runtime permission ids used by the Bluetooth workflows.
pub mod perms {
    pub const BLUETOOTH_CONNECT: &str = "android.permission.BLUETOOTH_CONNECT";
    pub const BLUETOOTH_SCAN: &str = "android.permission.BLUETOOTH_SCAN";
    pub const BLUETOOTH_ADMIN: &str = "android.permission.BLUETOOTH_ADMIN";
    pub const BLUETOOTH_PRIVILEGED: &str = "android.permission.BLUETOOTH_PRIVILEGED";
    pub const ACCESS_FINE_LOCATION: &str = "android.permission.ACCESS_FINE_LOCATION";
    pub const ACCESS_COARSE_LOCATION: &str = "android.permission.ACCESS_COARSE_LOCATION";
}

/// The platform's permission surface: grant checks, the
/// previously-denied-so-explain-yourself heuristic, and firing the actual
/// permission dialog. Request completion arrives asynchronously through
/// `PermissionCoordinator::on_permission_result`.
pub trait PermissionLauncher: Send + Sync {
    fn is_granted(&self, permission: &str) -> bool;
    fn should_show_rationale(&self, permission: &str) -> bool;
    fn request(&self, permission: &str);
}

/// Displays a dismissible prompt explaining why a permission is needed.
/// The callback fires exactly once with whether the user accepted.
pub trait RationaleShower: Send + Sync {
    fn show_rationale_with_action(&self, rationale: &str, callback: Box<dyn FnOnce(bool) + Send>);
}

/// Gated operation results cross the job registry type-erased (the registry
/// is shared by calls with different result types) and are downcast back on
/// the awaiting side.
type AnyResult = Option<Box<dyn Any + Send>>;

/// A boxed gated operation, used where operations have to be stored or
/// nested rather than passed straight through generics.
pub type BoxOperation<T> = Box<dyn FnOnce() -> BoxFuture<'static, T> + Send>;

struct PermissionDescriptor {
    rationale: String,
    launcher: Arc<dyn PermissionLauncher>,
}

/// Gates the execution of arbitrary operations behind platform permission
/// grants.
///
/// Cheaply clonable; all clones share the descriptor registry and the
/// pending-job registry.
#[derive(Clone)]
pub struct PermissionCoordinator {
    inner: Arc<PermissionCoordinatorInner>,
}

struct PermissionCoordinatorInner {
    platform: Arc<dyn PermissionLauncher>,

    // Written once per permission during setup, read-only afterwards
    descriptors: DashMap<String, PermissionDescriptor>,

    // Operations parked until the platform reports the grant outcome,
    // keyed by permission id
    jobs: JobRegistry<String, AnyResult, AnyResult>,
}

impl PermissionCoordinator {
    pub fn new(platform: Arc<dyn PermissionLauncher>) -> Self {
        Self { inner: Arc::new(PermissionCoordinatorInner { platform,
                                                           descriptors: DashMap::new(),
                                                           jobs: JobRegistry::new() }) }
    }

    /// Registers a request launcher and rationale text for `permission`.
    /// Idempotent per id; meant to be called once per permission at setup
    /// time. Descriptors are never removed.
    pub fn configure(&self, permission: &str, rationale: &str) {
        let launcher = self.inner.platform.clone();
        self.inner
            .descriptors
            .entry(permission.to_string())
            .or_insert_with(|| PermissionDescriptor { rationale: rationale.to_string(),
                                                      launcher });
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.inner.platform.is_granted(permission)
    }

    fn is_configured(&self, permission: &str) -> bool {
        self.inner.descriptors.contains_key(permission)
    }

    /// Runs `operation` if `bypass()` is true (platform versions where the
    /// permission doesn't exist) or the permission is already granted;
    /// otherwise asks the platform for the grant first, parking the
    /// operation until the result callback arrives.
    ///
    /// Returns `None` when the permission was never `configure`d, when the
    /// user refuses at the rationale prompt, on denial, or when no grant
    /// arrives within `PERMISSION_GRANT_TIMEOUT`. On the rationale path an
    /// accepted prompt only fires the request; the operation is abandoned
    /// for this call and the primed grant benefits the next attempt.
    pub async fn run_gated<T, F, Fut>(&self,
                                      permission: &str,
                                      rationale_shower: Arc<dyn RationaleShower>,
                                      bypass: impl Fn() -> bool + Send,
                                      operation: F)
                                      -> Option<T>
        where T: Send + 'static,
              F: FnOnce() -> Fut + Send + 'static,
              Fut: Future<Output = T> + Send + 'static
    {
        if bypass() || self.has_permission(permission) {
            return Some(operation().await);
        }

        if !self.is_configured(permission) {
            warn!("Can't ask for permission {} without a registered launcher, \
                   try configure({:?}, <rationale>) first",
                  permission, permission);
            return None;
        }

        let (rationale, launcher) = {
            // NB: the DashMap guard must not be held across an await
            let descriptor = self.inner.descriptors.get(permission)?;
            (descriptor.rationale.clone(), descriptor.launcher.clone())
        };

        if launcher.should_show_rationale(permission) {
            let perm = permission.to_string();
            let request_launcher = launcher.clone();
            rationale_shower.show_rationale_with_action(&rationale,
                                                        Box::new(move |accepted| {
                                                            if accepted {
                                                                request_launcher.request(&perm);
                                                            } else {
                                                                debug!("User refused to grant permission {}",
                                                                       perm);
                                                            }
                                                        }));
            None
        } else {
            launcher.request(permission);
            let task: JobTask<AnyResult> =
                Box::new(move || {
                    async move { Some(Box::new(operation().await) as Box<dyn Any + Send>) }.boxed()
                });
            let handle = self.inner.jobs.register_job(permission.to_string(), task);
            match handle.await_result(PERMISSION_GRANT_TIMEOUT).await {
                Ok(Some(value)) => match value.downcast::<T>() {
                    Ok(value) => Some(*value),
                    Err(_) => {
                        warn!("Dropping result of operation gated on {} with an unexpected type",
                              permission);
                        None
                    }
                },
                Ok(None) => None,
                Err(_timeout) => {
                    debug!("Timed out waiting for permission {} to be granted", permission);
                    None
                }
            }
        }
    }

    /// Folds `run_gated` over `permissions` in list order: each
    /// permission's grant nests the next one's request, so the final
    /// operation only runs once every permission in the list has been
    /// granted. Denial or timeout at any stage short-circuits the rest. An
    /// empty list runs the operation directly.
    pub fn run_gated_multi<T>(&self,
                              permissions: Vec<String>,
                              rationale_shower: Arc<dyn RationaleShower>,
                              bypass: Arc<dyn Fn() -> bool + Send + Sync>,
                              operation: BoxOperation<T>)
                              -> BoxFuture<'static, Option<T>>
        where T: Send + 'static
    {
        let this = self.clone();
        async move {
            match permissions.len() {
                0 => Some(operation().await),
                1 => {
                    let perm = match permissions.into_iter().next() {
                        Some(perm) => perm,
                        None => return None,
                    };
                    this.run_gated(&perm, rationale_shower, move || bypass(), move || operation())
                        .await
                }
                _ => {
                    let mut rest = permissions;
                    let first = rest.remove(0);
                    let nested_this = this.clone();
                    let nested_shower = rationale_shower.clone();
                    let nested_bypass = bypass.clone();
                    let nested: BoxOperation<Option<T>> =
                        Box::new(move || {
                            nested_this.run_gated_multi(rest,
                                                        nested_shower,
                                                        nested_bypass,
                                                        operation)
                        });
                    this.run_gated(&first,
                                   rationale_shower,
                                   move || bypass(),
                                   move || nested())
                        .await
                        .flatten()
                }
            }
        }
        .boxed()
    }

    /// Boundary callback for platform permission request results: drains
    /// every job parked under `permission` and, if granted, runs each
    /// parked operation in FIFO order delivering its result through the
    /// job's completion slot; if denied, delivers `None` into every slot
    /// without running anything.
    pub async fn on_permission_result(&self, permission: &str, granted: bool) {
        let jobs = self.inner.jobs.consume_jobs(permission.to_string()).await;
        if granted {
            debug!("Permission {} granted, releasing {} parked job(s)",
                   permission,
                   jobs.len());
            for job in jobs {
                let (value, resolver) = job.run().await;
                resolver.resolve(value);
            }
        } else {
            debug!("Permission {} denied, failing {} parked job(s)",
                   permission,
                   jobs.len());
            for job in jobs {
                job.resolve(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::fake::{FakeLauncher, FakeRationale};

    fn coordinator(launcher: &Arc<FakeLauncher>) -> PermissionCoordinator {
        let coordinator = PermissionCoordinator::new(launcher.clone() as Arc<dyn PermissionLauncher>);
        coordinator.configure(perms::BLUETOOTH_SCAN, "Scanning needs this.");
        coordinator
    }

    fn no_bypass() -> impl Fn() -> bool + Send {
        || false
    }

    #[tokio::test]
    async fn granted_permission_runs_operation_without_a_request() {
        let launcher = Arc::new(FakeLauncher::new());
        launcher.grant(perms::BLUETOOTH_SCAN);
        let coordinator = coordinator(&launcher);
        let shower = Arc::new(FakeRationale::accepting());

        let result = coordinator.run_gated(perms::BLUETOOTH_SCAN,
                                           shower,
                                           no_bypass(),
                                           || async { 42u32 })
                                .await;
        assert_eq!(result, Some(42));
        assert!(launcher.requests().is_empty());
    }

    #[tokio::test]
    async fn granted_permission_needs_no_configuration() {
        let launcher = Arc::new(FakeLauncher::new());
        launcher.grant("android.permission.NEVER_CONFIGURED");
        let coordinator = PermissionCoordinator::new(launcher.clone() as Arc<dyn PermissionLauncher>);
        let shower = Arc::new(FakeRationale::accepting());

        let result = coordinator.run_gated("android.permission.NEVER_CONFIGURED",
                                           shower,
                                           no_bypass(),
                                           || async { 42u32 })
                                .await;
        assert_eq!(result, Some(42));
    }

    #[tokio::test]
    async fn bypass_skips_the_grant_check_entirely() {
        let launcher = Arc::new(FakeLauncher::new());
        let coordinator = PermissionCoordinator::new(launcher.clone() as Arc<dyn PermissionLauncher>);
        let shower = Arc::new(FakeRationale::accepting());

        let result = coordinator.run_gated("android.permission.NEVER_CONFIGURED",
                                           shower,
                                           || true,
                                           || async { 42u32 })
                                .await;
        assert_eq!(result, Some(42));
        assert!(launcher.requests().is_empty());
    }

    #[tokio::test]
    async fn unconfigured_permission_fails_fast() {
        let launcher = Arc::new(FakeLauncher::new());
        let coordinator = PermissionCoordinator::new(launcher.clone() as Arc<dyn PermissionLauncher>);
        let shower = Arc::new(FakeRationale::accepting());
        let ran = Arc::new(AtomicU32::new(0));

        let ran_in_op = ran.clone();
        let result = coordinator.run_gated("android.permission.NEVER_CONFIGURED",
                                           shower,
                                           no_bypass(),
                                           move || async move {
                                               ran_in_op.fetch_add(1, Ordering::SeqCst);
                                           })
                                .await;
        assert_eq!(result, None);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(launcher.requests().is_empty());
    }

    #[tokio::test]
    async fn grant_callback_releases_the_parked_operation() {
        let _ = env_logger::builder().is_test(true).try_init();

        let launcher = Arc::new(FakeLauncher::new());
        let coordinator = coordinator(&launcher);
        let shower = Arc::new(FakeRationale::accepting());

        let gated = coordinator.run_gated(perms::BLUETOOTH_SCAN,
                                          shower,
                                          no_bypass(),
                                          || async { "scanning" });
        let driver = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(launcher.requests(), vec![perms::BLUETOOTH_SCAN.to_string()]);
            coordinator.on_permission_result(perms::BLUETOOTH_SCAN, true).await;
        };
        let (result, _) = tokio::join!(gated, driver);
        assert_eq!(result, Some("scanning"));
    }

    #[tokio::test]
    async fn denial_fails_the_call_without_running_the_operation() {
        let launcher = Arc::new(FakeLauncher::new());
        let coordinator = coordinator(&launcher);
        let shower = Arc::new(FakeRationale::accepting());
        let ran = Arc::new(AtomicU32::new(0));

        let ran_in_op = ran.clone();
        let gated = coordinator.run_gated(perms::BLUETOOTH_SCAN,
                                          shower,
                                          no_bypass(),
                                          move || async move {
                                              ran_in_op.fetch_add(1, Ordering::SeqCst);
                                          });
        let driver = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            coordinator.on_permission_result(perms::BLUETOOTH_SCAN, false).await;
        };
        let (result, _) = tokio::join!(gated, driver);
        assert_eq!(result, None);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rationale_acceptance_fires_the_request_but_abandons_the_call() {
        let launcher = Arc::new(FakeLauncher::new());
        launcher.recommend_rationale(perms::BLUETOOTH_SCAN);
        let coordinator = coordinator(&launcher);
        let shower = Arc::new(FakeRationale::accepting());

        let result = coordinator.run_gated(perms::BLUETOOTH_SCAN,
                                           shower.clone(),
                                           no_bypass(),
                                           || async { 42u32 })
                                .await;
        assert_eq!(result, None);
        assert_eq!(launcher.requests(), vec![perms::BLUETOOTH_SCAN.to_string()]);
        assert_eq!(shower.shown(), vec!["Scanning needs this.".to_string()]);
    }

    #[tokio::test]
    async fn rationale_refusal_never_fires_the_request() {
        let launcher = Arc::new(FakeLauncher::new());
        launcher.recommend_rationale(perms::BLUETOOTH_SCAN);
        let coordinator = coordinator(&launcher);
        let shower = Arc::new(FakeRationale::refusing());

        let result = coordinator.run_gated(perms::BLUETOOTH_SCAN,
                                           shower,
                                           no_bypass(),
                                           || async { 42u32 })
                                .await;
        assert_eq!(result, None);
        assert!(launcher.requests().is_empty());
    }

    #[tokio::test]
    async fn multi_gate_runs_the_operation_exactly_once_when_all_granted() {
        let launcher = Arc::new(FakeLauncher::new());
        launcher.grant(perms::BLUETOOTH_SCAN);
        launcher.grant(perms::BLUETOOTH_CONNECT);
        let coordinator = coordinator(&launcher);
        let shower = Arc::new(FakeRationale::accepting());
        let ran = Arc::new(AtomicU32::new(0));

        let ran_in_op = ran.clone();
        let operation: BoxOperation<u32> = Box::new(move || {
            async move { ran_in_op.fetch_add(1, Ordering::SeqCst) }.boxed()
        });
        let result = coordinator.run_gated_multi(vec![perms::BLUETOOTH_SCAN.to_string(),
                                                      perms::BLUETOOTH_CONNECT.to_string()],
                                                 shower,
                                                 Arc::new(|| false),
                                                 operation)
                                .await;
        assert_eq!(result, Some(0));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn multi_gate_short_circuits_on_a_denied_permission() {
        let launcher = Arc::new(FakeLauncher::new());
        launcher.grant(perms::BLUETOOTH_SCAN);
        let coordinator = coordinator(&launcher);
        coordinator.configure(perms::BLUETOOTH_CONNECT, "Connecting needs this.");
        let shower = Arc::new(FakeRationale::accepting());
        let ran = Arc::new(AtomicU32::new(0));

        let ran_in_op = ran.clone();
        let operation: BoxOperation<()> = Box::new(move || {
            async move {
                ran_in_op.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        });
        let gated = coordinator.run_gated_multi(vec![perms::BLUETOOTH_SCAN.to_string(),
                                                     perms::BLUETOOTH_CONNECT.to_string()],
                                                shower,
                                                Arc::new(|| false),
                                                operation);
        let driver = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            // The second permission in the list is the one asked for
            assert_eq!(launcher.requests(), vec![perms::BLUETOOTH_CONNECT.to_string()]);
            coordinator.on_permission_result(perms::BLUETOOTH_CONNECT, false).await;
        };
        let (result, _) = tokio::join!(gated, driver);
        assert_eq!(result, None);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_permission_list_runs_directly() {
        let launcher = Arc::new(FakeLauncher::new());
        let coordinator = PermissionCoordinator::new(launcher as Arc<dyn PermissionLauncher>);
        let shower = Arc::new(FakeRationale::accepting());

        let operation: BoxOperation<u32> = Box::new(|| async { 7u32 }.boxed());
        let result = coordinator.run_gated_multi(vec![], shower, Arc::new(|| false), operation)
                                .await;
        assert_eq!(result, Some(7));
    }
}
