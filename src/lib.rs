//! Library to catalog MySQL/MariaDB servers and backup their databases.
//!
//! A run first converges the [catalog] with the databases each server
//! actually hosts ([catalog::reconcile]) and then dumps every database flagged
//! for backup using the [backup::Orchestrator]. The dumps are produced by
//! `mysqldump`, optionally through an SSH hop ([remote]), and shipped to an
//! [storage::ObjectStore].

#![forbid(unsafe_code)]

pub mod backup;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod driver;
pub mod remote;
pub mod storage;
