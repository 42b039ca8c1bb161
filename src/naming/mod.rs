// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Service discovery: instance model, change detection, cache and facade.

pub mod differ;
pub mod holder;
pub mod messages;
pub mod model;
pub mod proxy;

pub use differ::{InstancesDiff, InstancesDiffer};
pub use holder::{InstancesChangeEvent, ServiceInfoHolder};
pub use model::{Instance, ServiceSnapshot, DEFAULT_CLUSTER, DEFAULT_GROUP};
pub use proxy::{NamingGrpcProxy, NotifySubscriberHandler};
