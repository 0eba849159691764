pub mod aws;
pub mod build;
pub mod build_log;
pub mod cleanup;
pub mod compute;
pub mod config_loader;
pub mod deployer;
pub mod dispatcher;
pub mod dns;
pub mod domain;
pub mod ec2;
pub mod git;
pub mod lifecycle;
pub mod notify;
pub mod packaging;
pub mod plugins;
pub mod process;
pub mod remote;
pub mod route53;
pub mod service;
pub mod service_graph;
pub mod source;
pub mod ssh;
