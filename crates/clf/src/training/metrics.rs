//! Loss diagnostics and per-epoch training history.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Individual terms of the Lyapunov loss and how often each condition holds.
///
/// Percentages are over the points each term applies to; an empty safe or
/// unsafe set counts as fully satisfied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LyapunovDiagnostics {
    pub goal_term: f64,
    pub safe_term: f64,
    pub safe_satisfied_pct: f64,
    /// Number of states in the safe mask.
    #[serde(default)]
    pub safe_count: usize,
    pub unsafe_term: f64,
    pub unsafe_satisfied_pct: f64,
    #[serde(default)]
    pub unsafe_count: usize,
    pub descent_term: f64,
    pub descent_satisfied_pct: f64,
    pub v_dot_term: f64,
    pub relaxation_term: f64,
}

impl LyapunovDiagnostics {
    /// Warnings for conditions that usually mean training has stalled.
    pub fn health_check(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.goal_term > 1e-2 {
            warnings.push(format!("V(x_goal)² = {:.3e} is not near zero", self.goal_term));
        }
        if self.descent_satisfied_pct < 50.0 {
            warnings.push(format!(
                "descent condition holds at only {:.1}% of states",
                self.descent_satisfied_pct
            ));
        }
        if self.relaxation_term > 1.0 {
            warnings.push(format!(
                "mean CLF relaxation {:.3} is large",
                self.relaxation_term
            ));
        }
        warnings
    }
}

impl fmt::Display for LyapunovDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "goal={:.3e} safe={:.3e} ({:.1}%) unsafe={:.3e} ({:.1}%) descent={:.3e} ({:.1}%) v_dot={:.3e} relax={:.3e}",
            self.goal_term,
            self.safe_term,
            self.safe_satisfied_pct,
            self.unsafe_term,
            self.unsafe_satisfied_pct,
            self.descent_term,
            self.descent_satisfied_pct,
            self.v_dot_term,
            self.relaxation_term,
        )
    }
}

/// The controller loss term.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerDiagnostics {
    pub controller_term: f64,
}

/// Running mean of diagnostics over evaluation chunks.
///
/// Batch-mean terms are weighted by chunk rows and the safe and unsafe terms
/// by their mask counts, so the average equals the single-pass value over the
/// concatenated chunks. The loss is rebuilt as the sum of the averaged terms.
#[derive(Debug, Default)]
pub(crate) struct RunningAvg {
    lyapunov: LyapunovDiagnostics,
    controller: ControllerDiagnostics,
    rows: usize,
}

impl RunningAvg {
    pub(crate) fn update(
        &mut self,
        rows: usize,
        lyapunov: &LyapunovDiagnostics,
        controller: &ControllerDiagnostics,
    ) {
        let w = rows as f64;
        let safe = lyapunov.safe_count as f64;
        let unsafe_ = lyapunov.unsafe_count as f64;
        let acc = &mut self.lyapunov;
        acc.goal_term += w * lyapunov.goal_term;
        acc.safe_term += safe * lyapunov.safe_term;
        acc.safe_satisfied_pct += safe * lyapunov.safe_satisfied_pct;
        acc.safe_count += lyapunov.safe_count;
        acc.unsafe_term += unsafe_ * lyapunov.unsafe_term;
        acc.unsafe_satisfied_pct += unsafe_ * lyapunov.unsafe_satisfied_pct;
        acc.unsafe_count += lyapunov.unsafe_count;
        acc.descent_term += w * lyapunov.descent_term;
        acc.descent_satisfied_pct += w * lyapunov.descent_satisfied_pct;
        acc.v_dot_term += w * lyapunov.v_dot_term;
        acc.relaxation_term += w * lyapunov.relaxation_term;
        self.controller.controller_term += w * controller.controller_term;
        self.rows += rows;
    }

    /// `(loss, lyapunov, controller)` means, or `None` before any rows.
    pub(crate) fn average(&self) -> Option<(f64, LyapunovDiagnostics, ControllerDiagnostics)> {
        if self.rows == 0 {
            return None;
        }
        let w = self.rows as f64;
        let l = &self.lyapunov;
        let (safe_term, safe_satisfied_pct) =
            masked_average(l.safe_term, l.safe_satisfied_pct, l.safe_count);
        let (unsafe_term, unsafe_satisfied_pct) =
            masked_average(l.unsafe_term, l.unsafe_satisfied_pct, l.unsafe_count);
        let lyapunov = LyapunovDiagnostics {
            goal_term: l.goal_term / w,
            safe_term,
            safe_satisfied_pct,
            safe_count: l.safe_count,
            unsafe_term,
            unsafe_satisfied_pct,
            unsafe_count: l.unsafe_count,
            descent_term: l.descent_term / w,
            descent_satisfied_pct: l.descent_satisfied_pct / w,
            v_dot_term: l.v_dot_term / w,
            relaxation_term: l.relaxation_term / w,
        };
        let controller = ControllerDiagnostics {
            controller_term: self.controller.controller_term / w,
        };
        let loss = lyapunov.goal_term
            + lyapunov.safe_term
            + lyapunov.unsafe_term
            + lyapunov.descent_term
            + lyapunov.v_dot_term
            + lyapunov.relaxation_term
            + controller.controller_term;
        Some((loss, lyapunov, controller))
    }
}

/// Count-weighted `(term, pct)` sums back to means; an empty set is `(0, 100)`.
fn masked_average(term: f64, pct: f64, count: usize) -> (f64, f64) {
    if count == 0 {
        (0.0, 100.0)
    } else {
        (term / count as f64, pct / count as f64)
    }
}

/// What happened in one training epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub learning_rate: f64,
    pub relaxation_penalty: f64,
    pub controller_loss_coeff: f64,
    pub train_loss: f64,
    pub test_loss: f64,
    /// Whether this epoch produced a new best checkpoint.
    pub improved: bool,
    pub lyapunov: LyapunovDiagnostics,
    pub controller: ControllerDiagnostics,
}

/// Records of every completed epoch, in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochRecord>,
}

impl TrainingHistory {
    pub fn push(&mut self, record: EpochRecord) {
        self.epochs.push(record);
    }

    /// Epoch with the lowest test loss.
    pub fn best(&self) -> Option<&EpochRecord> {
        self.epochs
            .iter()
            .min_by(|a, b| a.test_loss.total_cmp(&b.test_loss))
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }
}
