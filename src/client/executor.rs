// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use crate::config_service::ConfigService;
use crate::error::BoxFuture;
use crate::lock::LockProxy;
use crate::naming::NamingGrpcProxy;
use crate::redo::{ConfigListenRedo, InstanceRedoData, LockRedo, RedoExecutor, SubscribeRedo};
use std::sync::Arc;

/// Replays redo entries through the facades' raw request methods.
pub struct ClientRedoExecutor {
    naming: Arc<NamingGrpcProxy>,
    locks: Arc<LockProxy>,
    configs: Arc<ConfigService>,
}

impl ClientRedoExecutor {
    pub fn new(naming: Arc<NamingGrpcProxy>, locks: Arc<LockProxy>, configs: Arc<ConfigService>) -> Self {
        Self { naming, locks, configs }
    }
}

impl RedoExecutor for ClientRedoExecutor {
    fn register_instance<'a>(&'a self, data: &'a InstanceRedoData) -> BoxFuture<'a, ()> {
        Box::pin(self.naming.do_register(data))
    }

    fn deregister_instance<'a>(&'a self, data: &'a InstanceRedoData) -> BoxFuture<'a, ()> {
        Box::pin(self.naming.do_deregister(data))
    }

    fn subscribe<'a>(&'a self, data: &'a SubscribeRedo) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.naming.do_subscribe(data).await?;
            Ok(())
        })
    }

    fn unsubscribe<'a>(&'a self, data: &'a SubscribeRedo) -> BoxFuture<'a, ()> {
        Box::pin(self.naming.do_unsubscribe(data))
    }

    fn lock<'a>(&'a self, data: &'a LockRedo) -> BoxFuture<'a, bool> {
        Box::pin(self.locks.do_lock(data))
    }

    fn unlock<'a>(&'a self, data: &'a LockRedo) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.locks.do_unlock(data).await?;
            Ok(())
        })
    }

    fn listen_config<'a>(&'a self, data: &'a ConfigListenRedo) -> BoxFuture<'a, ()> {
        Box::pin(self.configs.do_listen(data))
    }

    fn unlisten_config<'a>(&'a self, data: &'a ConfigListenRedo) -> BoxFuture<'a, ()> {
        Box::pin(self.configs.do_unlisten(data))
    }
}
