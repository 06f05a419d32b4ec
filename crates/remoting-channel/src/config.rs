use std::sync::Arc;

use remoting_proto::Mode;

use crate::role::{AllowAll, RoleChecker};

/// Tunables for a single channel, all with conservative defaults.
#[derive(Clone)]
pub struct ChannelConfig {
    /// How many entries the unexport audit log retains before evicting the
    /// oldest. `0` disables the log entirely.
    pub unexport_log_size: usize,
    /// Whether a re-thrown remote exception chains the local stack as its
    /// cause, or stands alone.
    pub chain_cause: bool,
    /// Advertised receive-window size for pipes opened on this channel.
    pub pipe_window_size: u32,
    /// Preamble/encoding mode to use for this side of the handshake.
    pub mode: Mode,
    /// Whether the peer is allowed to invoke arbitrary exported callables, or
    /// only ones this side explicitly whitelisted.
    pub arbitrary_callable_allowed: bool,
    role_checker: Arc<dyn RoleChecker>,
}

impl ChannelConfig {
    pub fn role_checker(&self) -> &dyn RoleChecker {
        self.role_checker.as_ref()
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            unexport_log_size: 1024,
            chain_cause: false,
            pipe_window_size: 131_072,
            mode: Mode::Negotiate,
            arbitrary_callable_allowed: false,
            role_checker: Arc::new(AllowAll),
        }
    }
}

/// Builds a [`ChannelConfig`], mirroring the way channel names, executors,
/// and class-filtering policy get assembled before a channel is opened.
#[derive(Clone, Default)]
pub struct ChannelBuilder {
    name: Option<String>,
    config: ChannelConfig,
}

impl ChannelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn unexport_log_size(mut self, size: usize) -> Self {
        self.config.unexport_log_size = size;
        self
    }

    pub fn chain_cause(mut self, chain: bool) -> Self {
        self.config.chain_cause = chain;
        self
    }

    pub fn pipe_window_size(mut self, size: u32) -> Self {
        self.config.pipe_window_size = size;
        self
    }

    pub fn arbitrary_callable_allowed(mut self, allowed: bool) -> Self {
        self.config.arbitrary_callable_allowed = allowed;
        self
    }

    pub fn role_checker(mut self, checker: Arc<dyn RoleChecker>) -> Self {
        self.config.role_checker = checker;
        self
    }

    pub fn channel_name(&self) -> &str {
        self.name.as_deref().unwrap_or("channel")
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn into_config(self) -> ChannelConfig {
        self.config
    }
}
