use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Sentinel for "no particle": an ID that can never belong to a real track.
pub const NO_TRACK_ID: i32 = i32::MIN;

/// Process label that marks a track as seeded directly from a truth record.
pub const PRIMARY_PROCESS: &str = "primary";

const TRANSPORTATION_PROCESS: &str = "Transportation";
const START_PROCESS: &str = "Start";

/// Relative disagreement between the engine-reported velocity and the locally
/// computed step velocity above which the zero-PDG timing correction applies.
const VELOCITY_AGREEMENT_TOLERANCE: f64 = 1e-4;

/// Defensive bound on the parent-substitution walk. Causal admission order
/// means no cycles can exist, but a malformed stream must not hang the walk.
const ANCESTOR_WALK_LIMIT: usize = 10_000;

const DEFAULT_NOT_STORED_PHYSICS: [&str; 10] = [
    "conv",
    "LowEnConversion",
    "Pair",
    "compt",
    "Compt",
    "Brem",
    "phot",
    "Photo",
    "Ion",
    "annihil",
];

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error(
        "causal order violation: no truth index recorded for parent {parent_id} of track {track_id}"
    )]
    MissingParentTruthIndex { track_id: i32, parent_id: i32 },
    #[error("retained track {track_id} reached finalization with an empty trajectory")]
    EmptyTrajectory { track_id: i32 },
    #[error(
        "primary track {track_id} has no generated-particle index for truth record {truth_index}"
    )]
    UnmatchedPrimary { track_id: i32, truth_index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Position+time or momentum+energy four-vector, in the units the transport
/// binding already normalized to (cm, ns, GeV).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct FourVector {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub t: f64,
}

/// One retained trajectory sample. The process tag is omitted for plain
/// transportation steps unless `keep_transportation` is configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryPoint {
    pub position: FourVector,
    pub momentum: FourVector,
    #[serde(default)]
    pub process: Option<String>,
}

/// A retained simulated particle, owned by the genealogy store until the
/// finalization pass transfers it into the event output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    pub track_id: i32,
    pub pdg_code: i32,
    pub process: String,
    pub parent_id: i32,
    pub mass: f64,
    pub weight: f64,
    pub status_code: i32,
    pub polarization: Vector3,
    #[serde(default)]
    pub end_process: Option<String>,
    #[serde(default)]
    pub daughters: Vec<i32>,
    #[serde(default)]
    pub trajectory: Vec<TrajectoryPoint>,
}

impl Particle {
    fn new(track_id: i32, pdg_code: i32, process: String, parent_id: i32, mass: f64) -> Self {
        Self {
            track_id,
            pdg_code,
            process,
            parent_id,
            mass,
            weight: 1.0,
            status_code: 1,
            polarization: Vector3::default(),
            end_process: None,
            daughters: Vec::new(),
            trajectory: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.parent_id == 0
    }

    fn add_point(
        &mut self,
        position: FourVector,
        momentum: FourVector,
        process: &str,
        keep_transportation: bool,
    ) {
        let tag = if process == TRANSPORTATION_PROCESS && !keep_transportation {
            None
        } else {
            Some(process.to_string())
        };
        self.trajectory.push(TrajectoryPoint { position, momentum, process: tag });
    }
}

/// Reduced-fidelity copy of a dropped particle: identity plus the first and
/// last trajectory samples only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedParticle {
    pub track_id: i32,
    pub pdg_code: i32,
    pub process: String,
    pub parent_id: i32,
    pub status_code: i32,
    pub generator: String,
    pub start: TrajectoryPoint,
    pub end: TrajectoryPoint,
}

/// Abstract handle to one external truth record: its generator label and the
/// number of generated particles it holds (stable indices `0..particle_count`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruthRecord {
    pub generator: String,
    pub particle_count: usize,
}

/// Primary-particle provenance carried by a track-creation event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryProvenance {
    pub truth_index: usize,
    pub generated_index: usize,
    pub process: String,
}

/// Track-creation event, with IDs local to the current session (pre-offset).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackCreation {
    pub track_id: i32,
    pub parent_id: i32,
    pub pdg_code: i32,
    #[serde(default)]
    pub process: String,
    pub kinetic_energy: f64,
    pub mass: f64,
    #[serde(default)]
    pub polarization: Vector3,
    #[serde(default)]
    pub proper_time: f64,
    #[serde(default)]
    pub primary: Option<PrimaryProvenance>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepPoint {
    pub position: FourVector,
    pub momentum: FourVector,
}

/// One completed step of the active track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub pre: StepPoint,
    pub post: StepPoint,
    /// Post-step process name; `None` means the step had no defining process.
    #[serde(default)]
    pub process: Option<String>,
    /// True when the step was defined by a step-limiting process.
    #[serde(default)]
    pub step_limited: bool,
    #[serde(default)]
    pub step_length: f64,
    #[serde(default)]
    pub time_delta: f64,
    /// Track velocity as reported by the transport engine.
    #[serde(default)]
    pub velocity: f64,
}

/// Track-end event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackEnd {
    pub final_point: StepPoint,
    /// `None` marks a degenerate zero-length final step.
    #[serde(default)]
    pub process: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

/// Outcome of one track admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The track was admitted and is now the active particle.
    Retained { track_id: i32 },
    /// The track matched an excluded process; a record may have been archived.
    DroppedByProcess { track_id: i32, effective_id: i32 },
    /// The track fell below the energy cut; no record was created.
    DroppedByEnergyCut { track_id: i32, effective_id: i32 },
    /// The track was already fully decayed at creation; its provenance was
    /// recorded but no particle record was stored.
    AlreadyDecayed { track_id: i32 },
}

/// One particle-to-truth association in the event output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruthAssociation {
    pub truth_index: usize,
    pub particle_index: usize,
    #[serde(default)]
    pub generated_index: Option<usize>,
}

/// Final collections assembled by the finalization pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventOutput {
    pub particles: Vec<Particle>,
    pub dropped: Vec<DroppedParticle>,
    pub ancestry: BTreeMap<i32, BTreeSet<i32>>,
    pub associations: Vec<TruthAssociation>,
    pub rejection_counts: BTreeMap<String, u64>,
}

/// Per-truth-record trajectory storage decision, built once per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratorPolicy {
    pub label: String,
    pub storable: bool,
}

/// Static retention configuration, resolved once at kernel construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Kinetic-energy threshold in GeV below which non-pseudo tracks are dropped.
    pub energy_cut: f64,
    pub store_trajectories: bool,
    /// Generator labels whose trajectories are storable; empty keeps all.
    pub keep_gen_trajectories: Vec<String>,
    pub keep_em_shower_daughters: bool,
    /// Process-name substrings excluded when shower-daughter suppression is on.
    /// Empty selects the built-in electromagnetic list at resolution time.
    pub not_stored_physics: Vec<String>,
    pub keep_only_primary_full_trajectories: bool,
    pub sparsify_trajectories: bool,
    pub sparsify_margin: f64,
    pub keep_second_to_last: bool,
    pub keep_transportation: bool,
    pub store_dropped_particles: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            energy_cut: 0.0,
            store_trajectories: true,
            keep_gen_trajectories: Vec::new(),
            keep_em_shower_daughters: true,
            not_stored_physics: Vec::new(),
            keep_only_primary_full_trajectories: false,
            sparsify_trajectories: false,
            sparsify_margin: 0.015,
            keep_second_to_last: false,
            keep_transportation: false,
            store_dropped_particles: false,
        }
    }
}

impl KernelConfig {
    /// Resolve conditional defaults into a concrete configuration.
    #[must_use]
    pub fn resolved(mut self) -> Self {
        let custom_not_stored = !self.not_stored_physics.is_empty();
        if self.keep_em_shower_daughters {
            if custom_not_stored {
                warn!(
                    "not_stored_physics provided but keep_em_shower_daughters is set; \
                     the exclusion list will be ignored"
                );
            }
        } else {
            if !custom_not_stored {
                self.not_stored_physics =
                    DEFAULT_NOT_STORED_PHYSICS.iter().map(ToString::to_string).collect();
            }
            info!(
                excluded = ?self.not_stored_physics,
                "full tracking information will not be stored for these processes"
            );
        }

        if self.sparsify_trajectories {
            info!(margin = self.sparsify_margin, "trajectory sparsification enabled");
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotStatus {
    /// The track is still inside its trajectory phase.
    Active,
    /// The track ended normally and awaits transfer into the event output.
    PendingTransfer,
}

#[derive(Debug, Clone)]
struct StoredParticle {
    particle: Particle,
    status: SlotStatus,
}

/// Single-slot handle to the particle currently accumulating trajectory
/// samples. Holds the arena key, never a reference into the arena.
#[derive(Debug, Clone, Copy)]
struct ActiveTrack {
    track_id: i32,
    keep_full_trajectory: bool,
    pdg_code: i32,
    generated_index: Option<usize>,
}

/// Particle provenance and trajectory retention engine.
///
/// Consumes the causal per-track, per-step lifecycle of one simulated event
/// (`begin_session`, then interleaved `admit`/`step`/`end_track`, then
/// `finalize`) and produces the retained-particle, dropped-particle, ancestry
/// and truth-association collections. Only the track-ID offset survives
/// across sessions.
#[derive(Debug)]
pub struct GenealogyKernel {
    config: KernelConfig,
    particles: BTreeMap<i32, StoredParticle>,
    dropped: BTreeMap<i32, Particle>,
    parent_substitution: BTreeMap<i32, i32>,
    effective_ids: BTreeMap<i32, i32>,
    ancestry: BTreeMap<i32, BTreeSet<i32>>,
    truth_indices: BTreeMap<i32, usize>,
    primary_process_keep: BTreeMap<i32, bool>,
    generator_keep: Vec<GeneratorPolicy>,
    primary_truth: BTreeMap<i32, usize>,
    rejection_counts: BTreeMap<String, u64>,
    current: Option<ActiveTrack>,
    track_id_offset: i32,
}

impl GenealogyKernel {
    #[must_use]
    pub fn new(config: KernelConfig) -> Self {
        Self {
            config: config.resolved(),
            particles: BTreeMap::new(),
            dropped: BTreeMap::new(),
            parent_substitution: BTreeMap::new(),
            effective_ids: BTreeMap::new(),
            ancestry: BTreeMap::new(),
            truth_indices: BTreeMap::new(),
            primary_process_keep: BTreeMap::new(),
            generator_keep: Vec::new(),
            primary_truth: BTreeMap::new(),
            rejection_counts: BTreeMap::new(),
            current: None,
            track_id_offset: 0,
        }
    }

    #[must_use]
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Offset applied to the next session's local track IDs.
    #[must_use]
    pub fn track_id_offset(&self) -> i32 {
        self.track_id_offset
    }

    /// Per-truth-record storage decisions for the current session.
    #[must_use]
    pub fn generator_policies(&self) -> &[GeneratorPolicy] {
        &self.generator_keep
    }

    /// Effective identity of an admitted track: its own (offset) ID when
    /// retained, the negated retained ancestor when filtered out, or
    /// [`NO_TRACK_ID`] when no retained ancestor exists.
    #[must_use]
    pub fn effective_track_id(&self, track_id: i32) -> i32 {
        self.effective_ids.get(&track_id).copied().unwrap_or(NO_TRACK_ID)
    }

    /// Reset all per-event state and build the generator keep-map for this
    /// session's truth records. The persistent track-ID offset is untouched.
    pub fn begin_session(&mut self, truth: &[TruthRecord]) {
        self.particles.clear();
        self.dropped.clear();
        self.parent_substitution.clear();
        self.effective_ids.clear();
        self.ancestry.clear();
        self.truth_indices.clear();
        self.primary_process_keep.clear();
        self.primary_truth.clear();
        self.rejection_counts.clear();
        self.current = None;

        if !self.config.keep_em_shower_daughters {
            for process in &self.config.not_stored_physics {
                self.rejection_counts.insert(process.clone(), 0);
            }
        }

        let custom_keep = !self.config.keep_gen_trajectories.is_empty();
        let mut kept = 0_usize;
        self.generator_keep = truth
            .iter()
            .map(|record| {
                let storable = self.config.store_trajectories
                    && (!custom_keep
                        || self.config.keep_gen_trajectories.contains(&record.generator));
                if storable {
                    kept += 1;
                }
                debug!(generator = %record.generator, storable, "generator keep decision");
                GeneratorPolicy { label: record.generator.clone(), storable }
            })
            .collect();

        if kept == 0 && custom_keep && self.config.store_trajectories {
            warn!(
                "keep_gen_trajectories matched none of this event's generators; \
                 no trajectory points will be stored for any of them"
            );
        }
    }

    /// Admit one newly created track, resolving its parentage and deciding
    /// whether and how to retain it.
    ///
    /// # Errors
    /// Returns [`KernelError::MissingParentTruthIndex`] when a non-primary
    /// track's resolved parent has no recorded truth index, which indicates a
    /// causal-order violation by the event-stream producer.
    pub fn admit(&mut self, creation: &TrackCreation) -> Result<Admission, KernelError> {
        let track_id = creation.track_id + self.track_id_offset;
        let mut parent_id = creation.parent_id + self.track_id_offset;
        self.effective_ids.insert(track_id, track_id);

        let mut generated_index = None;
        let mut excluded = false;

        let (process, truth_index, from_primary_process) = if let Some(primary) =
            &creation.primary
        {
            // Primary provenance always wins over whatever parent the
            // transport engine reported.
            parent_id = 0;
            generated_index = Some(primary.generated_index);

            let (process, flagged) = if primary.process == PRIMARY_PROCESS {
                (PRIMARY_PROCESS.to_string(), true)
            } else if primary.process.starts_with(PRIMARY_PROCESS) {
                debug!(
                    track_id,
                    process = %primary.process,
                    "truth process starts with but is not exactly \"primary\"; \
                     full trajectory storage stays restricted for this lineage"
                );
                (primary.process.clone(), false)
            } else {
                warn!(
                    track_id,
                    process = %primary.process,
                    "truth process does not begin with \"primary\"; overriding"
                );
                (PRIMARY_PROCESS.to_string(), true)
            };
            (process, primary.truth_index, flagged)
        } else {
            let process = creation.process.clone();

            if !self.config.keep_em_shower_daughters {
                let matched = self
                    .config
                    .not_stored_physics
                    .iter()
                    .find(|not_stored| process.contains(not_stored.as_str()))
                    .cloned();
                if let Some(matched) = matched {
                    debug!(track_id, process = %process, "track matches excluded process");
                    *self.rejection_counts.entry(matched).or_insert(0) += 1;
                    self.record_dropped_track(track_id, parent_id);
                    excluded = true;
                }
            }

            if creation.kinetic_energy < self.config.energy_cut && creation.pdg_code != 0 {
                let effective = self.record_dropped_track(track_id, parent_id);
                self.current = None;
                return Ok(Admission::DroppedByEnergyCut { track_id, effective_id: effective });
            }

            // The direct parent may itself have been filtered out; walk the
            // substitution map toward a retained ancestor before inheriting.
            if !self.particles.contains_key(&parent_id) && !self.dropped.contains_key(&parent_id) {
                self.parent_substitution.insert(track_id, parent_id);
                let resolved = self.ultimate_parent(parent_id);
                if self.particles.contains_key(&resolved)
                    || self.dropped.contains_key(&parent_id)
                {
                    parent_id = resolved;
                } else {
                    warn!(
                        track_id,
                        parent_id,
                        "cannot resolve parent in the genealogy store; keeping the \
                         unresolved parent id as a diagnostic aid"
                    );
                }
            }

            let Some(truth_index) = self.truth_indices.get(&parent_id).copied() else {
                return Err(KernelError::MissingParentTruthIndex { track_id, parent_id });
            };
            let inherited_flag =
                self.primary_process_keep.get(&parent_id).copied().unwrap_or(false);
            (process, truth_index, inherited_flag)
        };

        let mut particle =
            Particle::new(track_id, creation.pdg_code, process, parent_id, creation.mass);
        particle.polarization = creation.polarization;

        self.truth_indices.insert(track_id, truth_index);
        self.primary_process_keep.insert(track_id, from_primary_process);

        let keep_full_trajectory = if !self.config.store_trajectories {
            false
        } else if !self.generator_keep.get(truth_index).is_some_and(|policy| policy.storable) {
            false
        } else if !self.config.keep_only_primary_full_trajectories {
            true
        } else {
            from_primary_process
        };

        self.current = None;

        // A nonzero proper time means the track is already fully decayed at
        // creation; its provenance stays recorded but no record is stored.
        if creation.proper_time != 0.0 {
            return Ok(Admission::AlreadyDecayed { track_id });
        }

        if excluded {
            if self.config.store_dropped_particles {
                self.dropped.insert(track_id, particle);
            }
            let effective = self.effective_track_id(track_id);
            return Ok(Admission::DroppedByProcess { track_id, effective_id: effective });
        }

        self.particles.insert(track_id, StoredParticle {
            particle,
            status: SlotStatus::Active,
        });
        self.current = Some(ActiveTrack {
            track_id,
            keep_full_trajectory,
            pdg_code: creation.pdg_code,
            generated_index,
        });
        Ok(Admission::Retained { track_id })
    }

    /// Append trajectory samples for one completed step of the active track.
    /// No-op when no track is active or the step has no defining process.
    pub fn step(&mut self, step: &StepRecord) {
        let Some(current) = self.current else {
            return;
        };
        let Some(process) = step.process.as_deref() else {
            return;
        };
        let keep_transportation = self.config.keep_transportation;
        let Some(stored) = self.particles.get_mut(&current.track_id) else {
            return;
        };

        let mut post = step.post;
        if current.pdg_code == 0 {
            // Zero-rest-mass tracks can report a first-step time computed
            // from the wrong velocity; rebuild the post-step time from the
            // engine-reported velocity when the two disagree.
            let step_velocity = step.step_length / step.time_delta;
            if (step.velocity - step_velocity).abs() > VELOCITY_AGREEMENT_TOLERANCE {
                post.position.t =
                    post.position.t - step.time_delta + step.step_length / step.velocity;
            }
        }

        if stored.particle.trajectory.is_empty() {
            // Every particle gets at least its creation point, regardless of
            // the retention flag. The pre-step sample carries the correct
            // vertex time, which was not available at admission.
            stored.particle.add_point(
                step.pre.position,
                step.pre.momentum,
                START_PROCESS,
                keep_transportation,
            );
        }

        if !step.step_limited && current.keep_full_trajectory {
            stored.particle.add_point(post.position, post.momentum, process, keep_transportation);
        }
    }

    /// Close out the active track: final weight, end process, the single end
    /// sample for two-point trajectories or sparsification for full ones, and
    /// the primary truth-association entry.
    pub fn end_track(&mut self, end: &TrackEnd) {
        let Some(current) = self.current else {
            return;
        };

        let Some(process) = end.process.as_deref() else {
            // Degenerate zero-length final step: the record must be fully
            // removed, not archived in place, so later passes never iterate
            // over a logically discarded entry.
            if let Some(removed) = self.particles.remove(&current.track_id) {
                if self.config.store_dropped_particles && !current.keep_full_trajectory {
                    let mut particle = removed.particle;
                    particle.weight = end.weight;
                    self.dropped.insert(current.track_id, particle);
                }
            }
            self.current = None;
            return;
        };

        let keep_transportation = self.config.keep_transportation;
        let sparsify = self.config.sparsify_trajectories;
        let sparsify_margin = self.config.sparsify_margin;
        let keep_second_to_last = self.config.keep_second_to_last;

        if let Some(stored) = self.particles.get_mut(&current.track_id) {
            stored.particle.weight = end.weight;
            stored.particle.end_process = Some(process.to_string());

            if current.keep_full_trajectory {
                if sparsify {
                    sparsify_trajectory(
                        &mut stored.particle.trajectory,
                        sparsify_margin,
                        keep_second_to_last,
                    );
                }
            } else {
                // Exactly one end sample; particles with a full trajectory
                // already carry their final point.
                stored.particle.add_point(
                    end.final_point.position,
                    end.final_point.momentum,
                    process,
                    keep_transportation,
                );
            }
            stored.status = SlotStatus::PendingTransfer;
        }

        if let Some(generated_index) = current.generated_index {
            self.primary_truth.insert(current.track_id, generated_index);
        }
        self.current = None;
    }

    /// End-of-event consistency pass: daughter backfill, offset computation,
    /// and assembly of the output collections.
    ///
    /// # Errors
    /// Returns [`KernelError::EmptyTrajectory`] when a retained particle has
    /// no trajectory sample, or [`KernelError::UnmatchedPrimary`] when a
    /// primary-parented particle has no recorded generated-particle index.
    /// Both indicate a violation of the causal-order contract.
    pub fn finalize(&mut self, truth: &[TruthRecord]) -> Result<EventOutput, KernelError> {
        if self.rejection_counts.values().any(|count| *count > 0) {
            info!(counts = ?self.rejection_counts, "excluded-process rejection summary");
        }

        self.backfill_daughters();
        self.advance_offset();

        let mut particles_out: Vec<Particle> = Vec::new();
        let mut associations: Vec<TruthAssociation> = Vec::new();
        for truth_index in 0..truth.len() {
            let matching: Vec<i32> = self
                .particles
                .keys()
                .filter(|id| self.truth_indices.get(id).copied() == Some(truth_index))
                .copied()
                .collect();
            for track_id in matching {
                let Some(stored) = self.particles.remove(&track_id) else {
                    continue;
                };
                if stored.status == SlotStatus::Active {
                    warn!(track_id, "transferring a particle that never reached track end");
                }
                if stored.particle.trajectory.is_empty() {
                    return Err(KernelError::EmptyTrajectory { track_id });
                }
                let generated_index = self.primary_truth.get(&track_id).copied();
                if generated_index.is_none() && stored.particle.is_primary() {
                    return Err(KernelError::UnmatchedPrimary { track_id, truth_index });
                }
                associations.push(TruthAssociation {
                    truth_index,
                    particle_index: particles_out.len(),
                    generated_index,
                });
                particles_out.push(stored.particle);
            }
        }

        let dropped_out = self.collect_dropped(truth);
        let output = EventOutput {
            particles: particles_out,
            dropped: dropped_out,
            ancestry: std::mem::take(&mut self.ancestry),
            associations,
            rejection_counts: self.rejection_counts.clone(),
        };

        self.particles.clear();
        self.dropped.clear();
        self.current = None;
        Ok(output)
    }

    /// Record a filtered-out track in the substitution and ancestry maps and
    /// compute its effective identity.
    fn record_dropped_track(&mut self, track_id: i32, parent_id: i32) -> i32 {
        self.parent_substitution.insert(track_id, parent_id);
        let ancestor = self.ultimate_parent(track_id);
        self.ancestry.entry(ancestor).or_default().insert(track_id);
        let effective = if self.particles.contains_key(&ancestor) {
            -ancestor
        } else {
            NO_TRACK_ID
        };
        self.effective_ids.insert(track_id, effective);
        effective
    }

    /// Walk the parent-substitution map to the nearest ID with no further
    /// substitution. Returns [`NO_TRACK_ID`] when the starting ID has no
    /// entry at all.
    fn ultimate_parent(&self, track_id: i32) -> i32 {
        let mut parent = NO_TRACK_ID;
        let mut cursor = track_id;
        for _ in 0..ANCESTOR_WALK_LIMIT {
            match self.parent_substitution.get(&cursor) {
                Some(next) => {
                    parent = *next;
                    cursor = *next;
                }
                None => return parent,
            }
        }
        warn!(track_id, "parent-substitution walk exceeded its bound; stream is non-causal");
        parent
    }

    fn backfill_daughters(&mut self) {
        let links: Vec<(i32, i32)> = self
            .particles
            .iter()
            .map(|(id, stored)| (*id, stored.particle.parent_id))
            .collect();
        for (track_id, parent_id) in links {
            // Primaries have no recorded mother; orphans are expected when
            // the parent was filtered upstream.
            if parent_id <= 0 {
                continue;
            }
            if let Some(parent) = self.particles.get_mut(&parent_id) {
                parent.particle.daughters.push(track_id);
            }
        }
    }

    fn advance_offset(&mut self) {
        let mut highest = 0_i32;
        for id in self.particles.keys() {
            highest = highest.max(*id);
        }
        for id in self.dropped.keys() {
            highest = highest.max(*id);
        }
        if !self.particles.is_empty() {
            self.track_id_offset = highest + 1;
            debug!(highest, offset = self.track_id_offset, "advanced track-id offset");
        }
    }

    fn collect_dropped(&self, truth: &[TruthRecord]) -> Vec<DroppedParticle> {
        if !self.config.store_dropped_particles {
            return Vec::new();
        }
        let mut out = Vec::new();
        for (track_id, particle) in &self.dropped {
            let (Some(start), Some(end)) =
                (particle.trajectory.first(), particle.trajectory.last())
            else {
                continue;
            };
            let generator = self
                .truth_indices
                .get(track_id)
                .and_then(|index| truth.get(*index))
                .map(|record| record.generator.clone())
                .unwrap_or_default();
            out.push(DroppedParticle {
                track_id: particle.track_id,
                pdg_code: particle.pdg_code,
                process: particle.process.clone(),
                parent_id: particle.parent_id,
                status_code: particle.status_code,
                generator,
                start: start.clone(),
                end: end.clone(),
            });
        }
        out
    }
}

/// Reduce a dense trajectory to the points that matter: endpoints,
/// process-tagged samples, and samples deviating from the local chord by more
/// than the margin. Trajectories of three or fewer points are left alone.
fn sparsify_trajectory(points: &mut Vec<TrajectoryPoint>, margin: f64, keep_second_to_last: bool) {
    if points.len() <= 3 {
        return;
    }
    let last = points.len() - 1;
    let mut keep = vec![false; points.len()];
    keep[0] = true;
    keep[last] = true;
    if keep_second_to_last {
        keep[last - 1] = true;
    }

    let mut anchor = 0_usize;
    for index in 1..last {
        if keep[index] {
            anchor = index;
            continue;
        }
        let tagged = points[index].process.is_some();
        if tagged || chord_deviation(&points[anchor], &points[index], &points[index + 1]) > margin {
            keep[index] = true;
            anchor = index;
        }
    }

    let mut cursor = 0_usize;
    points.retain(|_| {
        let kept = keep[cursor];
        cursor += 1;
        kept
    });
}

/// Perpendicular distance of `point` from the chord between `from` and `to`.
fn chord_deviation(from: &TrajectoryPoint, point: &TrajectoryPoint, to: &TrajectoryPoint) -> f64 {
    let ax = to.position.x - from.position.x;
    let ay = to.position.y - from.position.y;
    let az = to.position.z - from.position.z;
    let px = point.position.x - from.position.x;
    let py = point.position.y - from.position.y;
    let pz = point.position.z - from.position.z;

    let chord_sq = ax * ax + ay * ay + az * az;
    if chord_sq == 0.0 {
        return (px * px + py * py + pz * pz).sqrt();
    }
    let along = (px * ax + py * ay + pz * az) / chord_sq;
    let dx = px - along * ax;
    let dy = py - along * ay;
    let dz = pz - along * az;
    (dx * dx + dy * dy + dz * dz).sqrt()
}
