pub mod classifier;

pub use classifier::{
    Classifier,
    OnnxClassifier,
    Verdict,
    average_probabilities,
};
