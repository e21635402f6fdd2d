pub mod analytics;
pub mod archives;
pub mod assessments;
pub mod broadsheets;
pub mod classes;
pub mod core;
pub mod marks;
pub mod remarks;
pub mod settings;
pub mod students;
pub mod subjects;
pub mod teachers;
