pub mod context;
pub mod conversation;
pub mod kpi;
pub mod sandbox;
pub mod workflow;
