//! Selection engine (C8): the Best Instance Clock (BIC) algorithm and the
//! clustering discriminator (§4.4, §4.5).

use std::collections::HashMap;

use crate::clock::ClockId;
use crate::instance::{InstanceId, InstanceStatus};
use crate::time::Timespec;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Rule {
    Manual,
    State,
    NoAlarms,
    UserPriority,
    Clustering,
    ClockClass,
    TotalAccuracy,
    AllanVariance,
    StepsRemoved,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SelectionStrategy {
    Automatic,
    Manual,
    ManualAtStartup,
}

#[derive(Clone, Debug)]
pub struct SelectionPolicy {
    pub strategy: SelectionStrategy,
    pub rules: Vec<Rule>,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        SelectionPolicy {
            strategy: SelectionStrategy::Automatic,
            rules: vec![
                Rule::Manual,
                Rule::State,
                Rule::NoAlarms,
                Rule::UserPriority,
                Rule::Clustering,
                Rule::ClockClass,
                Rule::TotalAccuracy,
                Rule::AllanVariance,
                Rule::StepsRemoved,
            ],
        }
    }
}

#[derive(Clone, Debug)]
pub struct Candidate {
    pub id: InstanceId,
    pub name: String,
    pub manual_selected: bool,
    pub status: InstanceStatus,
}

/// Runs the BIC algorithm over `candidates`, returning exactly one
/// survivor's id. Never returns `None` for a non-empty input (§4.4).
pub fn select_bic(candidates: &[Candidate], policy: &SelectionPolicy, current: Option<InstanceId>) -> Option<InstanceId> {
    if candidates.is_empty() {
        return None;
    }

    let mut survivors: Vec<&Candidate> = candidates.iter().collect();

    for rule in &policy.rules {
        survivors = apply_hard_constraints(survivors);
        if survivors.len() <= 1 {
            break;
        }
        survivors = apply_rule(*rule, survivors);
        if survivors.len() <= 1 {
            break;
        }
    }
    survivors = apply_hard_constraints(survivors);

    if survivors.is_empty() {
        // Every candidate was excluded by a hard constraint; fall back to
        // the full input rather than returning nothing (§4.4's "never null
        // when the input is non-empty").
        survivors = candidates.iter().collect();
    }

    if survivors.len() == 1 {
        return Some(survivors[0].id);
    }

    if let Some(cur) = current {
        if let Some(c) = survivors.iter().find(|c| c.id == cur) {
            return Some(c.id);
        }
    }

    survivors.iter().min_by_key(|c| c.name.clone()).map(|c| c.id)
}

fn apply_hard_constraints<'a>(candidates: Vec<&'a Candidate>) -> Vec<&'a Candidate> {
    let must_be_selected: Vec<&Candidate> =
        candidates.iter().copied().filter(|c| c.status.constraints.must_be_selected).collect();
    let base = if !must_be_selected.is_empty() { must_be_selected } else { candidates };
    base.into_iter().filter(|c| !c.status.constraints.cannot_be_selected).collect()
}

fn apply_rule<'a>(rule: Rule, candidates: Vec<&'a Candidate>) -> Vec<&'a Candidate> {
    match rule {
        Rule::Manual => {
            let manual: Vec<&Candidate> = candidates.iter().copied().filter(|c| c.manual_selected).collect();
            if manual.is_empty() {
                candidates
            } else {
                manual
            }
        }
        Rule::State => keep_min_by(candidates, |c| c.status.state.priority()),
        Rule::NoAlarms => {
            let clean: Vec<&Candidate> = candidates.iter().copied().filter(|c| c.status.alarms.is_empty()).collect();
            if clean.is_empty() {
                candidates
            } else {
                clean
            }
        }
        Rule::UserPriority => keep_min_by(candidates, |c| c.status.user_priority),
        Rule::Clustering => keep_max_by(candidates, |c| c.status.clustering_score),
        Rule::ClockClass => keep_min_by(candidates, |c| c.status.master.map(|m| m.clock_class).unwrap_or(255)),
        Rule::TotalAccuracy => keep_min_by_f64(candidates, |c| c.status.master.map(|m| m.accuracy_ns).unwrap_or(f64::MAX)),
        Rule::AllanVariance => keep_min_by_f64(candidates, |c| c.status.master.map(|m| m.allan_variance).unwrap_or(f64::MAX)),
        Rule::StepsRemoved => keep_min_by(candidates, |c| c.status.master.map(|m| m.steps_removed).unwrap_or(u16::MAX)),
    }
}

fn keep_min_by<'a, K: Ord>(candidates: Vec<&'a Candidate>, key: impl Fn(&Candidate) -> K) -> Vec<&'a Candidate> {
    match candidates.iter().map(|c| key(c)).min() {
        Some(best) => candidates.into_iter().filter(|c| key(c) == best).collect(),
        None => candidates,
    }
}

fn keep_max_by<'a, K: Ord>(candidates: Vec<&'a Candidate>, key: impl Fn(&Candidate) -> K) -> Vec<&'a Candidate> {
    match candidates.iter().map(|c| key(c)).max() {
        Some(best) => candidates.into_iter().filter(|c| key(c) == best).collect(),
        None => candidates,
    }
}

fn keep_min_by_f64<'a>(candidates: Vec<&'a Candidate>, key: impl Fn(&Candidate) -> f64) -> Vec<&'a Candidate> {
    let best = candidates.iter().map(|c| key(c)).fold(f64::MAX, f64::min);
    candidates.into_iter().filter(|c| (key(c) - best).abs() < 1e-9).collect()
}

/// Clustering discriminator (§4.5). `offsets` maps every instance with a
/// currently valid offset to `(offset_ns, clock)`; `discriminator` names
/// the configured discriminator instance, if any.
#[derive(Clone, Copy, Debug)]
pub struct ClusteringInput {
    pub offset_ns: Option<f64>,
    pub clock: ClockId,
}

pub fn clustering_scores(
    offsets: &HashMap<InstanceId, ClusteringInput>,
    discriminator: Option<InstanceId>,
    clock_delta: impl Fn(ClockId, ClockId) -> Option<Timespec>,
    threshold_ns: f64,
    score_without_discriminator: u8,
) -> HashMap<InstanceId, u8> {
    let mut scores = HashMap::with_capacity(offsets.len());

    let disc_input = discriminator.and_then(|d| offsets.get(&d).map(|input| (d, input)));

    for (&id, input) in offsets {
        let score = match (disc_input, input.offset_ns) {
            _ if Some(id) == discriminator => 1,
            (Some((disc_id, disc_input)), Some(o_i)) if disc_id != id => {
                match (disc_input.offset_ns, clock_delta(disc_input.clock, input.clock)) {
                    (Some(o_d), Some(delta)) => {
                        let gap = delta.as_nanos_f64() - o_d + o_i;
                        if gap.abs() < threshold_ns {
                            1
                        } else {
                            0
                        }
                    }
                    _ => score_without_discriminator,
                }
            }
            _ => score_without_discriminator,
        };
        scores.insert(id, score);
    }

    scores
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{Alarms, Constraints, InstanceState};

    fn candidate(id: u32, name: &str, state: InstanceState, priority: i32) -> Candidate {
        Candidate {
            id: InstanceId(id),
            name: name.to_string(),
            manual_selected: false,
            status: InstanceStatus {
                state,
                alarms: Alarms::empty(),
                constraints: Constraints::default(),
                clock: ClockId(0),
                user_priority: priority,
                offset_from_master: Some(0.0),
                local_accuracy: 0.0,
                master: None,
                clustering_score: 1,
            },
        }
    }

    #[test]
    fn state_rule_prefers_slave_over_listening() {
        let candidates = vec![
            candidate(1, "a", InstanceState::Listening, 0),
            candidate(2, "b", InstanceState::Slave, 0),
        ];
        let policy = SelectionPolicy::default();
        assert_eq!(select_bic(&candidates, &policy, None), Some(InstanceId(2)));
    }

    #[test]
    fn tie_break_prefers_current_selection() {
        let candidates = vec![
            candidate(1, "a", InstanceState::Slave, 0),
            candidate(2, "b", InstanceState::Slave, 0),
        ];
        let policy = SelectionPolicy::default();
        assert_eq!(select_bic(&candidates, &policy, Some(InstanceId(2))), Some(InstanceId(2)));
    }

    #[test]
    fn tie_break_falls_back_to_lexicographically_smallest_name() {
        let candidates = vec![
            candidate(1, "zulu", InstanceState::Slave, 0),
            candidate(2, "alpha", InstanceState::Slave, 0),
        ];
        let policy = SelectionPolicy::default();
        assert_eq!(select_bic(&candidates, &policy, None), Some(InstanceId(2)));
    }

    #[test]
    fn must_be_selected_overrides_other_rules() {
        let mut a = candidate(1, "a", InstanceState::Slave, 0);
        let mut b = candidate(2, "b", InstanceState::Master, 5);
        b.status.constraints.must_be_selected = true;
        a.status.constraints.cannot_be_selected = false;
        let candidates = vec![a, b];
        let policy = SelectionPolicy::default();
        assert_eq!(select_bic(&candidates, &policy, None), Some(InstanceId(2)));
    }

    #[test]
    fn never_returns_none_for_nonempty_input() {
        let mut only = candidate(1, "a", InstanceState::Faulty, 0);
        only.status.constraints.cannot_be_selected = true;
        let candidates = vec![only];
        let policy = SelectionPolicy::default();
        assert!(select_bic(&candidates, &policy, None).is_some());
    }

    #[test]
    fn discriminator_instance_always_scores_one() {
        let mut offsets = HashMap::new();
        offsets.insert(InstanceId(1), ClusteringInput { offset_ns: Some(10.0), clock: ClockId(1) });
        let scores = clustering_scores(&offsets, Some(InstanceId(1)), |_, _| Some(Timespec::ZERO), 100.0, 0);
        assert_eq!(scores[&InstanceId(1)], 1);
    }

    #[test]
    fn small_grandmaster_gap_scores_one() {
        let mut offsets = HashMap::new();
        offsets.insert(InstanceId(1), ClusteringInput { offset_ns: Some(50.0), clock: ClockId(1) });
        offsets.insert(InstanceId(2), ClusteringInput { offset_ns: Some(55.0), clock: ClockId(2) });
        // delta(L_d, L_i) chosen so grandmaster_gap = delta - o_d + o_i = 0 - 50 + 55 = 5, within threshold
        let scores = clustering_scores(&offsets, Some(InstanceId(1)), |_, _| Some(Timespec::ZERO), 100.0, 0);
        assert_eq!(scores[&InstanceId(2)], 1);
    }

    #[test]
    fn large_grandmaster_gap_scores_zero() {
        let mut offsets = HashMap::new();
        offsets.insert(InstanceId(1), ClusteringInput { offset_ns: Some(50.0), clock: ClockId(1) });
        offsets.insert(InstanceId(2), ClusteringInput { offset_ns: Some(5000.0), clock: ClockId(2) });
        let scores = clustering_scores(&offsets, Some(InstanceId(1)), |_, _| Some(Timespec::ZERO), 100.0, 0);
        assert_eq!(scores[&InstanceId(2)], 0);
    }
}
