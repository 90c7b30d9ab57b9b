pub mod check;
pub mod connectors;
pub mod eval;
pub mod run;
