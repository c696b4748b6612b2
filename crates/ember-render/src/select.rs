// SPDX-License-Identifier: CEPL-1.0
use std::ffi::CStr;

use ember_core::{EngineError, Origin};

use crate::backend::QueueFamilies;

pub const BASE_SCORE: u32 = 10;
pub const DISCRETE_BONUS: u32 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    Discrete,
    Integrated,
    Virtual,
    Cpu,
    Other,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceFeatures {
    pub sampler_anisotropy: bool,
    pub fill_mode_non_solid: bool,
    pub dynamic_rendering: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilyInfo {
    pub queue_count: u32,
    pub graphics: bool,
    pub compute: bool,
    pub transfer: bool,
    /// Result of the per-family surface support query.
    pub present: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceCandidate {
    pub name: String,
    pub kind: DeviceKind,
    pub surface_format_count: usize,
    pub present_mode_count: usize,
    pub features: DeviceFeatures,
    pub queue_families: Vec<QueueFamilyInfo>,
    /// Bitmask of supported sample counts (bit value == sample count).
    pub color_samples: u32,
    pub depth_samples: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Selection {
    /// Index into the candidate list (enumeration order).
    pub index: usize,
    pub families: QueueFamilies,
    pub score: u32,
    /// Highest sample count usable for both color and depth targets.
    pub max_samples: u32,
}

/// Graphics: first family with graphics. Transfer: a dedicated family if
/// one exists, else the first with transfer, else graphics. Present: the
/// graphics family when it can present, else the first family that can.
pub fn pick_queue_families(families: &[QueueFamilyInfo]) -> Option<QueueFamilies> {
    let usable = || {
        families
            .iter()
            .enumerate()
            .filter(|(_, f)| f.queue_count > 0)
            .map(|(i, f)| (i as u32, f))
    };

    let graphics = usable().find(|(_, f)| f.graphics).map(|(i, _)| i)?;
    let transfer = usable()
        .find(|(_, f)| f.transfer && !f.graphics && !f.compute)
        .or_else(|| usable().find(|(_, f)| f.transfer))
        .map(|(i, _)| i)
        .unwrap_or(graphics);
    let present = if families[graphics as usize].present {
        graphics
    } else {
        usable().find(|(_, f)| f.present).map(|(i, _)| i)?
    };

    Some(QueueFamilies {
        graphics,
        transfer,
        present,
    })
}

/// Why a candidate was rejected, `None` when it is eligible.
pub fn rejection(candidate: &DeviceCandidate) -> Option<&'static str> {
    let f = &candidate.features;
    if candidate.surface_format_count == 0 {
        Some("no surface formats")
    } else if candidate.present_mode_count == 0 {
        Some("no present modes")
    } else if !f.sampler_anisotropy {
        Some("no anisotropic sampling")
    } else if !f.fill_mode_non_solid {
        Some("no non-solid fill mode")
    } else if !f.dynamic_rendering {
        Some("no dynamic rendering")
    } else if pick_queue_families(&candidate.queue_families).is_none() {
        Some("missing graphics/transfer/present queue family")
    } else {
        None
    }
}

pub fn score(candidate: &DeviceCandidate) -> u32 {
    match candidate.kind {
        DeviceKind::Discrete => BASE_SCORE + DISCRETE_BONUS,
        _ => BASE_SCORE,
    }
}

/// Highest single bit of `color & depth`, at least 1.
pub fn max_sample_count(color: u32, depth: u32) -> u32 {
    let both = color & depth;
    if both == 0 {
        1
    } else {
        1 << (31 - both.leading_zeros())
    }
}

/// Highest score wins; ties go to the first candidate enumerated.
pub fn select_device(candidates: &[DeviceCandidate]) -> Result<Selection, EngineError> {
    let mut best: Option<Selection> = None;

    for (index, candidate) in candidates.iter().enumerate() {
        if let Some(reason) = rejection(candidate) {
            tracing::info!("gpu[{index}] `{}` rejected: {reason}", candidate.name);
            continue;
        }
        let Some(families) = pick_queue_families(&candidate.queue_families) else {
            continue;
        };
        let score = score(candidate);
        tracing::debug!("gpu[{index}] `{}` score={score}", candidate.name);

        if best.map_or(true, |b| score > b.score) {
            best = Some(Selection {
                index,
                families,
                score,
                max_samples: max_sample_count(candidate.color_samples, candidate.depth_samples),
            });
        }
    }

    best.ok_or_else(|| {
        EngineError::fatal(
            Origin::InitializationFailed,
            format!("no suitable GPU among {} candidates", candidates.len()),
        )
    })
}

/// Entries of `required` that `available` lacks.
pub fn missing_extensions<'a>(required: &[&'a CStr], available: &[&CStr]) -> Vec<&'a CStr> {
    required
        .iter()
        .copied()
        .filter(|req| !available.contains(req))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(graphics: bool, compute: bool, transfer: bool, present: bool) -> QueueFamilyInfo {
        QueueFamilyInfo {
            queue_count: 1,
            graphics,
            compute,
            transfer,
            present,
        }
    }

    fn candidate(name: &str, kind: DeviceKind) -> DeviceCandidate {
        DeviceCandidate {
            name: name.to_owned(),
            kind,
            surface_format_count: 2,
            present_mode_count: 1,
            features: DeviceFeatures {
                sampler_anisotropy: true,
                fill_mode_non_solid: true,
                dynamic_rendering: true,
            },
            queue_families: vec![family(true, true, true, true)],
            color_samples: 0b1111,
            depth_samples: 0b0111,
        }
    }

    #[test]
    fn test_single_universal_family_is_shared() {
        let families = pick_queue_families(&[family(true, true, true, true)]).unwrap();
        assert_eq!(
            families,
            QueueFamilies {
                graphics: 0,
                transfer: 0,
                present: 0
            }
        );
        assert!(!families.split_present());
        assert_eq!(families.unique(), vec![0]);
    }

    #[test]
    fn test_dedicated_transfer_family_preferred() {
        let families = pick_queue_families(&[
            family(true, true, true, true),
            family(false, true, true, false),
            family(false, false, true, false),
        ])
        .unwrap();
        assert_eq!(families.transfer, 2);
        assert_eq!(families.unique(), vec![0, 2]);
    }

    #[test]
    fn test_present_on_separate_family() {
        let families =
            pick_queue_families(&[family(true, true, true, false), family(false, false, false, true)])
                .unwrap();
        assert_eq!(families.present, 1);
        assert!(families.split_present());
    }

    #[test]
    fn test_missing_present_family_rejects() {
        assert!(pick_queue_families(&[family(true, true, true, false)]).is_none());
        let mut c = candidate("headless", DeviceKind::Discrete);
        c.queue_families = vec![family(true, true, true, false)];
        assert!(rejection(&c).is_some());
    }

    #[test]
    fn test_empty_families_are_skipped() {
        let mut empty = family(true, true, true, true);
        empty.queue_count = 0;
        let families = pick_queue_families(&[empty, family(true, false, true, true)]).unwrap();
        assert_eq!(families.graphics, 1);
    }

    #[test]
    fn test_discrete_outscores_integrated() {
        let picked = select_device(&[
            candidate("igpu", DeviceKind::Integrated),
            candidate("dgpu", DeviceKind::Discrete),
        ])
        .unwrap();
        assert_eq!(picked.index, 1);
        assert_eq!(picked.score, 110);
    }

    #[test]
    fn test_ties_keep_first_enumerated() {
        let picked = select_device(&[
            candidate("a", DeviceKind::Integrated),
            candidate("b", DeviceKind::Integrated),
        ])
        .unwrap();
        assert_eq!(picked.index, 0);
        assert_eq!(picked.score, BASE_SCORE);
    }

    #[test]
    fn test_ineligible_discrete_loses_to_eligible_integrated() {
        let mut dgpu = candidate("dgpu", DeviceKind::Discrete);
        dgpu.features.dynamic_rendering = false;
        let picked = select_device(&[dgpu, candidate("igpu", DeviceKind::Integrated)]).unwrap();
        assert_eq!(picked.index, 1);
    }

    #[test]
    fn test_no_eligible_device_is_fatal() {
        let mut c = candidate("nofmt", DeviceKind::Discrete);
        c.surface_format_count = 0;
        let err = select_device(&[c]).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.origin, Origin::InitializationFailed);
        assert!(select_device(&[]).is_err());
    }

    #[test]
    fn test_max_sample_count() {
        assert_eq!(max_sample_count(0b1111, 0b0111), 4);
        assert_eq!(max_sample_count(0b0001, 0b0001), 1);
        assert_eq!(max_sample_count(0b1000, 0b0001), 1);
        assert_eq!(max_sample_count(0b100_0000, 0b111_1111), 64);
    }

    #[test]
    fn test_missing_extensions() {
        let surface = c"VK_KHR_surface";
        let xlib = c"VK_KHR_xlib_surface";
        let wayland = c"VK_KHR_wayland_surface";
        let missing = missing_extensions(&[surface, xlib], &[surface, wayland]);
        assert_eq!(missing, vec![xlib]);
        assert!(missing_extensions(&[surface], &[surface]).is_empty());
    }
}
