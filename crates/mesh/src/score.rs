//! Peer capability scoring.
//!
//! `score = flag_similarity + resource_fit - load_penalty * assigned`
//!
//! Flag similarity is one minus the normalized Hamming distance between the
//! flags a task asks for and the flags a peer has. Resource fit scales CPU,
//! memory and spare load linearly into `[0, 1]` and averages them.

use cogwheel_core::capability::flags;
use cogwheel_core::{Capabilities, Requirements};

/// Headroom beyond this multiple of the requirement earns nothing extra.
const HEADROOM_CAP: f64 = 4.0;

pub fn flag_similarity(req: &Requirements, caps: &Capabilities) -> f64 {
    let mask = (1u32 << flags::WIDTH) - 1;
    let wanted = (req.required_flags | req.preferred_flags) & mask;
    let distance = (wanted ^ (caps.flags & mask)).count_ones();
    1.0 - distance as f64 / flags::WIDTH as f64
}

fn headroom(have: f64, need: f64) -> f64 {
    (have / need.max(1.0)).min(HEADROOM_CAP) / HEADROOM_CAP
}

pub fn resource_fit(req: &Requirements, caps: &Capabilities) -> f64 {
    let cpu = headroom(caps.cpu_cores as f64, req.min_cpu_cores as f64);
    let memory = headroom(caps.memory_mb as f64 / 1024.0, req.min_memory_mb as f64 / 1024.0);
    let spare = 1.0 - caps.load.clamp(0.0, 1.0);
    (cpu + memory + spare) / 3.0
}

/// Score a peer that may run the task, or `None` if it fails a hard
/// requirement or is at capacity.
pub fn score(req: &Requirements, caps: &Capabilities, assigned: u32, load_penalty: f64) -> Option<f64> {
    if !req.satisfied_by(caps) || assigned >= caps.max_tasks {
        return None;
    }
    Some(flag_similarity(req, caps) + resource_fit(req, caps) - load_penalty * assigned as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(flags: u32) -> Capabilities {
        Capabilities {
            flags,
            cpu_cores: 8,
            gpu_count: if flags & flags::GPU != 0 { 1 } else { 0 },
            memory_mb: 16_384,
            load: 0.0,
            max_tasks: 4,
        }
    }

    #[test]
    fn identical_flags_are_fully_similar() {
        let req = Requirements {
            required_flags: flags::GPU,
            preferred_flags: flags::CUDA,
            ..Default::default()
        };
        assert_eq!(flag_similarity(&req, &caps(flags::GPU | flags::CUDA)), 1.0);
        let partial = flag_similarity(&req, &caps(flags::GPU));
        assert!((partial - (1.0 - 1.0 / 6.0)).abs() < 1e-9);
    }

    #[test]
    fn hard_requirements_filter() {
        let req = Requirements::gpu();
        assert!(score(&req, &caps(0), 0, 0.1).is_none());
        assert!(score(&req, &caps(flags::GPU), 0, 0.1).is_some());
    }

    #[test]
    fn capacity_filter() {
        let req = Requirements::default();
        assert!(score(&req, &caps(0), 3, 0.1).is_some());
        assert!(score(&req, &caps(0), 4, 0.1).is_none());
    }

    #[test]
    fn assigned_tasks_lower_the_score() {
        let req = Requirements::default();
        let idle = score(&req, &caps(0), 0, 0.25).unwrap();
        let busy = score(&req, &caps(0), 2, 0.25).unwrap();
        assert!((idle - busy - 0.5).abs() < 1e-9);
    }

    #[test]
    fn load_and_resources_scale_linearly() {
        let req = Requirements::default();
        let mut loaded = caps(0);
        loaded.load = 0.5;
        let fresh = resource_fit(&req, &caps(0));
        assert!((fresh - resource_fit(&req, &loaded) - 0.5 / 3.0).abs() < 1e-9);

        let mut small = caps(0);
        small.cpu_cores = 2;
        assert!(resource_fit(&req, &small) < fresh);
    }

    #[test]
    fn unrelated_gpu_peer_scores_lower_for_plain_task() {
        let req = Requirements::default();
        let plain = score(&req, &caps(0), 0, 0.1).unwrap();
        let gpu = score(&req, &caps(flags::GPU), 0, 0.1).unwrap();
        assert!(plain > gpu);
    }
}
