//! Running work in short-lived pods

mod controller;
mod options;
mod runner;

#[cfg(test)]
pub use controller::{MockPodController, MockPodControllerFactory};
pub use controller::{
    KubePodController, KubePodControllerFactory, PodController, PodControllerFactory,
};
pub use options::{
    combine_overrides, merge_override, PodOptions, PvcMount, DEFAULT_CONTAINER_NAME,
    JOB_POD_PREFIX, MANAGED_BY_LABEL,
};
pub use runner::{CleanupTask, PodRunner};
