//! Threshold rule, batch metrics and classification reports.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Fuzz factor guarding divisions and logarithms.
pub const EPSILON: f32 = 1e-7;

/// Default decision threshold on the sigmoid output.
pub const DEFAULT_THRESHOLD: f32 = 0.5;

/// Positive (label 1) when `probability >= threshold`, negative otherwise.
#[must_use]
pub fn classify(probability: f32, threshold: f32) -> u8 {
    u8::from(probability >= threshold)
}

/// Loss, accuracy, precision, recall and F1 for one evaluation call.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub loss: f32,
    pub accuracy: f32,
    pub precision: f32,
    pub recall: f32,
    pub f1: f32,
}

impl Metrics {
    /// Computes metrics for sigmoid outputs against binary labels.
    ///
    /// Precision and recall count the positive class only; both carry
    /// [`EPSILON`] in the denominator so an empty class yields 0.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn compute(probabilities: &[f32], labels: &[f32], threshold: f32) -> Self {
        let n = probabilities.len().min(labels.len());
        if n == 0 {
            return Self::default();
        }

        let mut loss = 0.0;
        let mut correct = 0usize;
        let mut true_pos = 0usize;
        let mut pred_pos = 0usize;
        let mut actual_pos = 0usize;
        for (&p, &y) in probabilities.iter().zip(labels).take(n) {
            loss += binary_cross_entropy(p, y);
            let pred = classify(p, threshold);
            let truth = classify(y, 0.5);
            if pred == truth {
                correct += 1;
            }
            if pred == 1 {
                pred_pos += 1;
            }
            if truth == 1 {
                actual_pos += 1;
                if pred == 1 {
                    true_pos += 1;
                }
            }
        }

        let precision = true_pos as f32 / (pred_pos as f32 + EPSILON);
        let recall = true_pos as f32 / (actual_pos as f32 + EPSILON);
        Self {
            loss: loss / n as f32,
            accuracy: correct as f32 / n as f32,
            precision,
            recall,
            f1: 2.0 * (precision * recall) / (precision + recall + EPSILON),
        }
    }
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "loss: {:.4} - accuracy: {:.2}% - precision: {:.2}% - recall: {:.2}% - f1: {:.2}%",
            self.loss,
            self.accuracy * 100.0,
            self.precision * 100.0,
            self.recall * 100.0,
            self.f1 * 100.0
        )
    }
}

/// Clipped binary cross-entropy of one probability.
#[must_use]
pub fn binary_cross_entropy(probability: f32, label: f32) -> f32 {
    let p = probability.clamp(EPSILON, 1.0 - EPSILON);
    -(label * p.ln() + (1.0 - label) * (1.0 - p).ln())
}

/// Counts indexed `[truth][prediction]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    counts: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    /// Builds the matrix; labels at or above `num_classes` are ignored.
    #[must_use]
    pub fn new(truth: &[u8], predicted: &[u8], num_classes: usize) -> Self {
        let mut counts = vec![vec![0; num_classes]; num_classes];
        for (&t, &p) in truth.iter().zip(predicted) {
            if let Some(cell) = counts
                .get_mut(t as usize)
                .and_then(|row| row.get_mut(p as usize))
            {
                *cell += 1;
            }
        }
        Self { counts }
    }

    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.counts.len()
    }

    #[must_use]
    pub fn get(&self, truth: usize, predicted: usize) -> usize {
        self.counts
            .get(truth)
            .and_then(|row| row.get(predicted))
            .copied()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn support(&self, class: usize) -> usize {
        self.counts.get(class).map_or(0, |row| row.iter().sum())
    }

    #[must_use]
    pub fn predicted(&self, class: usize) -> usize {
        self.counts.iter().filter_map(|row| row.get(class)).sum()
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }

    #[must_use]
    pub fn correct(&self) -> usize {
        (0..self.num_classes()).map(|c| self.get(c, c)).sum()
    }
}

impl fmt::Display for ConfusionMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .counts
            .iter()
            .flatten()
            .map(|c| c.to_string().len())
            .max()
            .unwrap_or(1);
        for (i, row) in self.counts.iter().enumerate() {
            let cells: Vec<String> = row.iter().map(|c| format!("{c:>width$}")).collect();
            let open = if i == 0 { "[[" } else { " [" };
            let close = if i + 1 == self.counts.len() { "]]" } else { "]" };
            writeln!(f, "{open}{}{close}", cells.join(" "))?;
        }
        Ok(())
    }
}

/// Precision, recall, F1 and support of one class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassScores {
    pub name: String,
    pub precision: f32,
    pub recall: f32,
    pub f1: f32,
    pub support: usize,
}

/// Per-class scores with accuracy, macro and weighted averages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub classes: Vec<ClassScores>,
    pub accuracy: f32,
    pub macro_avg: ClassScores,
    pub weighted_avg: ClassScores,
}

impl ClassificationReport {
    /// Builds a report from a confusion matrix. Undefined ratios are 0.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_confusion(matrix: &ConfusionMatrix, names: &[String]) -> Self {
        let classes: Vec<ClassScores> = (0..matrix.num_classes())
            .map(|c| {
                let tp = matrix.get(c, c) as f32;
                let precision = ratio(tp, matrix.predicted(c) as f32);
                let recall = ratio(tp, matrix.support(c) as f32);
                ClassScores {
                    name: names.get(c).cloned().unwrap_or_else(|| c.to_string()),
                    precision,
                    recall,
                    f1: ratio(2.0 * precision * recall, precision + recall),
                    support: matrix.support(c),
                }
            })
            .collect();

        let total = matrix.total();
        let k = classes.len().max(1) as f32;
        let macro_avg = ClassScores {
            name: "macro avg".to_string(),
            precision: classes.iter().map(|c| c.precision).sum::<f32>() / k,
            recall: classes.iter().map(|c| c.recall).sum::<f32>() / k,
            f1: classes.iter().map(|c| c.f1).sum::<f32>() / k,
            support: total,
        };
        let weight = |pick: fn(&ClassScores) -> f32| {
            ratio(
                classes.iter().map(|c| pick(c) * c.support as f32).sum(),
                total as f32,
            )
        };
        let weighted_avg = ClassScores {
            name: "weighted avg".to_string(),
            precision: weight(|c| c.precision),
            recall: weight(|c| c.recall),
            f1: weight(|c| c.f1),
            support: total,
        };

        Self {
            accuracy: ratio(matrix.correct() as f32, total as f32),
            classes,
            macro_avg,
            weighted_avg,
        }
    }

    /// Report for thresholded predictions against ground-truth labels.
    #[must_use]
    pub fn from_labels(truth: &[u8], predicted: &[u8], names: &[String]) -> Self {
        let matrix = ConfusionMatrix::new(truth, predicted, names.len().max(2));
        Self::from_confusion(&matrix, names)
    }
}

fn ratio(num: f32, den: f32) -> f32 {
    if den > 0.0 {
        num / den
    } else {
        0.0
    }
}

impl fmt::Display for ClassificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .classes
            .iter()
            .map(|c| c.name.len())
            .chain(std::iter::once("weighted avg".len()))
            .max()
            .unwrap_or(12);

        writeln!(
            f,
            "{:>width$} {:>9} {:>9} {:>9} {:>9}",
            "", "precision", "recall", "f1-score", "support"
        )?;
        writeln!(f)?;
        for class in &self.classes {
            write_row(f, class, width)?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "{:>width$} {:>9} {:>9} {:>9.2} {:>9}",
            "accuracy", "", "", self.accuracy, self.macro_avg.support
        )?;
        write_row(f, &self.macro_avg, width)?;
        write_row(f, &self.weighted_avg, width)
    }
}

fn write_row(f: &mut fmt::Formatter<'_>, s: &ClassScores, width: usize) -> fmt::Result {
    writeln!(
        f,
        "{:>width$} {:>9.2} {:>9.2} {:>9.2} {:>9}",
        s.name, s.precision, s.recall, s.f1, s.support
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> Vec<String> {
        vec!["closed".to_string(), "open".to_string()]
    }

    #[test]
    fn threshold_is_inclusive_at_one_half() {
        assert_eq!(classify(0.5, DEFAULT_THRESHOLD), 1);
        assert_eq!(classify(0.499_999, DEFAULT_THRESHOLD), 0);
        assert_eq!(classify(0.0, DEFAULT_THRESHOLD), 0);
        assert_eq!(classify(1.0, DEFAULT_THRESHOLD), 1);
    }

    #[test]
    fn threshold_is_pure() {
        for p in [0.0, 0.1, 0.49, 0.5, 0.51, 0.9, 1.0] {
            assert_eq!(classify(p, 0.5), classify(p, 0.5));
        }
    }

    #[test]
    fn perfect_predictions() {
        let m = Metrics::compute(&[0.9, 0.1, 0.8, 0.2], &[1.0, 0.0, 1.0, 0.0], 0.5);
        assert!((m.accuracy - 1.0).abs() < 1e-6);
        assert!((m.precision - 1.0).abs() < 1e-5);
        assert!((m.recall - 1.0).abs() < 1e-5);
        assert!((m.f1 - 1.0).abs() < 1e-5);
        assert!(m.loss > 0.0 && m.loss < 0.25);
    }

    #[test]
    fn mixed_predictions() {
        // tp = 1, fp = 1, fn = 1, tn = 1
        let m = Metrics::compute(&[0.9, 0.7, 0.3, 0.1], &[1.0, 0.0, 1.0, 0.0], 0.5);
        assert!((m.accuracy - 0.5).abs() < 1e-6);
        assert!((m.precision - 0.5).abs() < 1e-5);
        assert!((m.recall - 0.5).abs() < 1e-5);
        assert!((m.f1 - 0.5).abs() < 1e-5);
    }

    #[test]
    fn no_positive_predictions_give_zero_precision() {
        let m = Metrics::compute(&[0.1, 0.2], &[1.0, 0.0], 0.5);
        assert!(m.precision.abs() < 1e-6);
        assert!(m.recall.abs() < 1e-6);
        assert!(m.f1.abs() < 1e-6);
    }

    #[test]
    fn empty_input_is_all_zero() {
        assert_eq!(Metrics::compute(&[], &[], 0.5), Metrics::default());
    }

    #[test]
    fn cross_entropy_is_clipped() {
        assert!(binary_cross_entropy(0.0, 1.0).is_finite());
        assert!(binary_cross_entropy(1.0, 0.0).is_finite());
        assert!(binary_cross_entropy(1.0, 1.0) < 1e-5);
    }

    #[test]
    fn confusion_matrix_counts() {
        let m = ConfusionMatrix::new(&[0, 0, 1, 1, 1], &[0, 1, 1, 1, 0], 2);
        assert_eq!(m.get(0, 0), 1);
        assert_eq!(m.get(0, 1), 1);
        assert_eq!(m.get(1, 0), 1);
        assert_eq!(m.get(1, 1), 2);
        assert_eq!(m.support(1), 3);
        assert_eq!(m.predicted(1), 3);
        assert_eq!(m.total(), 5);
        assert_eq!(m.to_string(), "[[1 1]\n [1 2]]\n");
    }

    #[test]
    fn report_scores() {
        let report = ClassificationReport::from_labels(&[0, 0, 1, 1, 1], &[0, 1, 1, 1, 0], &names());
        let open = &report.classes[1];
        assert!((open.precision - 2.0 / 3.0).abs() < 1e-6);
        assert!((open.recall - 2.0 / 3.0).abs() < 1e-6);
        assert_eq!(open.support, 3);
        assert!((report.accuracy - 0.6).abs() < 1e-6);
        assert!((report.macro_avg.recall - (0.5 + 2.0 / 3.0) / 2.0).abs() < 1e-6);

        let text = report.to_string();
        assert!(text.contains("closed"));
        assert!(text.contains("weighted avg"));
        assert!(text.contains("f1-score"));
    }

    #[test]
    fn report_handles_missing_class() {
        let report = ClassificationReport::from_labels(&[1, 1], &[1, 1], &names());
        assert!(report.classes[0].precision.abs() < 1e-6);
        assert_eq!(report.classes[0].support, 0);
        assert!((report.accuracy - 1.0).abs() < 1e-6);
    }
}
