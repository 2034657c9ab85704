pub mod candidate;

pub use candidate::{
    CandidateStatus, CareerEntry, EducationEntry, ProjectEntry, ResumeData,
};
