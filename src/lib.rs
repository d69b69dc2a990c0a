//! Command line front end: listen for topic events or publish one through a broker.

pub mod cli;
