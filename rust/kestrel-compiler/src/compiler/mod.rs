pub mod attributes;
pub mod cleanup;
pub mod finalize;
pub mod fixpoint;
pub mod identifiers;
pub mod imports;
pub mod knowledge;
pub mod options;
pub mod ownership;
pub mod trace;
