pub mod assessments;
pub mod backup;
pub mod calc;
pub mod categories;
pub mod core;
pub mod predict;
pub mod setup;
pub mod subjects;
