//! Effective resource requests of a pod.
//!
//! Init containers run one at a time before the main containers, except
//! sidecars (init containers with `restartPolicy: Always`), which keep
//! running for the pod's lifetime. The pod needs, per resource, the larger
//! of its init-phase peak and its steady state.

use nodeplan_api::{Container, Pod};
use nodeplan_core::resources::PODS;
use nodeplan_core::{Quantity, ResourceList};

/// Requests of the containers alone, without pod overhead.
pub fn aggregate(containers: &[Container], init_containers: &[Container]) -> ResourceList {
    let mut sidecars = ResourceList::new();
    let mut init_peak = ResourceList::new();

    for init in init_containers {
        let requests = init.effective_requests();
        let running = if init.is_sidecar() {
            sidecars.add_assign(&requests);
            sidecars.clone()
        } else {
            sidecars.add(&requests)
        };
        init_peak = init_peak.max(&running);
    }

    let mut steady = sidecars;
    for container in containers {
        steady.add_assign(&container.effective_requests());
    }
    steady.max(&init_peak)
}

/// Everything a pod consumes on a node: container requests, runtime
/// overhead, and one pod slot.
pub fn pod_requests(pod: &Pod) -> ResourceList {
    let mut requests = aggregate(&pod.containers, &pod.init_containers);
    requests.add_assign(&pod.overhead);
    requests.insert(PODS, Quantity::from_units(1));
    requests
}
