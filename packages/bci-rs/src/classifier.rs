// Binary mental-state classifier
//
// Feature columns are z-scored with statistics of the pooled training set,
// then separated by a Gaussian-kernel SVM. The normalization learned at
// training time is reused verbatim for every prediction.

use crate::error::{StreamError, StreamResult};
use crate::types::Decision;
use linfa::prelude::*;
use linfa_svm::Svm;
use ndarray::{concatenate, Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Misclassification penalty for both classes
const SVM_C: f64 = 1.0;

/// Per-feature mean and standard deviation of the training set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationParams {
    pub mean: Array1<f64>,
    pub std: Array1<f64>,
}

impl NormalizationParams {
    /// Column statistics using the population standard deviation
    ///
    /// Columns without spread get a std of 1 so they normalize to zero instead
    /// of NaN.
    pub fn fit(features: ArrayView2<f64>) -> StreamResult<Self> {
        let mean = features.mean_axis(Axis(0)).ok_or_else(|| {
            StreamError::InvalidInput("Cannot normalize an empty feature matrix".to_string())
        })?;
        let std = features
            .std_axis(Axis(0), 0.0)
            .mapv(|s| if s > 0.0 && s.is_finite() { s } else { 1.0 });
        Ok(Self { mean, std })
    }

    pub fn n_features(&self) -> usize {
        self.mean.len()
    }

    pub fn apply(&self, features: ArrayView2<f64>) -> StreamResult<Array2<f64>> {
        if features.ncols() != self.n_features() {
            return Err(StreamError::shape(
                format!("{} features", self.n_features()),
                format!("{} features", features.ncols()),
            ));
        }
        Ok((&features - &self.mean) / &self.std)
    }
}

/// Trained SVM together with the normalization it was trained under
pub struct TrainedClassifier {
    model: Svm<f64, bool>,
    norm: NormalizationParams,
    kernel_eps: f64,
    n_train: (usize, usize),
}

impl fmt::Debug for TrainedClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrainedClassifier")
            .field("n_features", &self.n_features())
            .field("kernel_eps", &self.kernel_eps)
            .field("n_train", &self.n_train)
            .finish_non_exhaustive()
    }
}

impl TrainedClassifier {
    pub fn n_features(&self) -> usize {
        self.norm.n_features()
    }

    pub fn normalization(&self) -> &NormalizationParams {
        &self.norm
    }

    /// Width `eps` of the Gaussian kernel `exp(-|x - y|^2 / eps)`
    pub fn kernel_eps(&self) -> f64 {
        self.kernel_eps
    }

    /// Training examples per class (class 0, class 1)
    pub fn training_counts(&self) -> (usize, usize) {
        self.n_train
    }

    /// Classify every row of `[n_vectors, n_features]`
    pub fn predict(&self, features: ArrayView2<f64>) -> StreamResult<Vec<Decision>> {
        let x = self.norm.apply(features)?;
        if x.nrows() == 0 {
            return Ok(Vec::new());
        }

        let labels: Array1<bool> = self.model.predict(&x);
        Ok(labels.iter().map(|&label| Decision::from(label)).collect())
    }

    pub fn predict_one(&self, feature_vector: ArrayView1<f64>) -> StreamResult<Decision> {
        let row = feature_vector.insert_axis(Axis(0));
        self.predict(row)?
            .first()
            .copied()
            .ok_or_else(|| StreamError::Classifier("SVM returned no prediction".to_string()))
    }
}

/// Kernel width matching the common "scale" heuristic: `n_features * var(X)`
fn scale_kernel_eps(x: &Array2<f64>) -> f64 {
    let var = x.var(0.0);
    let eps = x.ncols() as f64 * var;
    if eps > 0.0 && eps.is_finite() {
        eps
    } else {
        1.0
    }
}

/// Train on feature matrices of class 0 and class 1
pub fn train(
    features0: ArrayView2<f64>,
    features1: ArrayView2<f64>,
) -> StreamResult<TrainedClassifier> {
    if features0.nrows() == 0 || features1.nrows() == 0 {
        return Err(StreamError::InvalidInput(format!(
            "Both classes need training examples (class 0: {}, class 1: {})",
            features0.nrows(),
            features1.nrows()
        )));
    }
    if features0.ncols() != features1.ncols() {
        return Err(StreamError::shape(
            format!("{} features", features0.ncols()),
            format!("{} features", features1.ncols()),
        ));
    }

    let pooled = concatenate(Axis(0), &[features0.view(), features1.view()])
        .map_err(|e| StreamError::InvalidInput(format!("Cannot pool training sets: {}", e)))?;
    let targets: Array1<bool> = std::iter::repeat(false)
        .take(features0.nrows())
        .chain(std::iter::repeat(true).take(features1.nrows()))
        .collect();

    let norm = NormalizationParams::fit(pooled.view())?;
    let x = norm.apply(pooled.view())?;
    let kernel_eps = scale_kernel_eps(&x);

    log::info!(
        "Training SVM on {} + {} examples of {} features (kernel eps {:.4})",
        features0.nrows(),
        features1.nrows(),
        x.ncols(),
        kernel_eps
    );

    let dataset = Dataset::new(x, targets);
    let model = Svm::<f64, bool>::params()
        .pos_neg_weights(SVM_C, SVM_C)
        .gaussian_kernel(kernel_eps)
        .fit(&dataset)
        .map_err(|e| StreamError::Classifier(e.to_string()))?;

    Ok(TrainedClassifier {
        model,
        norm,
        kernel_eps,
        n_train: (features0.nrows(), features1.nrows()),
    })
}

/// Classify feature vectors with a trained model
pub fn test(
    classifier: &TrainedClassifier,
    features: ArrayView2<f64>,
) -> StreamResult<Vec<Decision>> {
    classifier.predict(features)
}
