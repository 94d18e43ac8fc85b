// Wire protocol shared by the client and anything that speaks to the query service.

pub mod commands;
pub mod envelope;
