//! Shared test fixtures for kube-failover-webhook tests.

#![allow(dead_code)]
