pub mod intake;
pub mod predictor;
pub mod queue;
pub mod reconcile;
pub mod status;
pub mod store;
pub mod worker;
