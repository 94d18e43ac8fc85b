// diql-common: wire protocol, analysis model, and result snapshots for the diql client.

pub mod analysis;
pub mod protocol;
pub mod result;
