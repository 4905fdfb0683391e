//! Tip lifecycle hooks.
//!
//! Which rack a tip comes from and where used tips go is host policy. The
//! transfer engine only decides *when* a tip is needed and calls a
//! [`TipHandler`]. Hosts either implement the trait or wrap two closures in
//! [`TipCallbacks`].

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::pipette::{Pipette, PipetteHandle};

/// Picks up and drops tips on behalf of the transfer engine.
#[async_trait]
pub trait TipHandler: Send + Sync {
    /// Mount a tip on `pipette`.
    async fn pick_up(&self, pipette: &PipetteHandle) -> Result<()>;
    /// Discard the tip mounted on `pipette`.
    async fn drop_tip(&self, pipette: &PipetteHandle) -> Result<()>;
}

/// Boxed tip callback.
pub type TipCallback = Arc<dyn Fn(PipetteHandle) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A [`TipHandler`] built from a pick and a drop function.
#[derive(Clone)]
pub struct TipCallbacks {
    pick: TipCallback,
    drop: TipCallback,
}

impl TipCallbacks {
    /// Handler calling `pick` and `drop` for every tip.
    pub fn new(
        pick: impl Fn(PipetteHandle) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
        drop: impl Fn(PipetteHandle) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            pick: Arc::new(pick),
            drop: Arc::new(drop),
        }
    }
}

#[async_trait]
impl TipHandler for TipCallbacks {
    async fn pick_up(&self, pipette: &PipetteHandle) -> Result<()> {
        (self.pick)(pipette.clone()).await
    }

    async fn drop_tip(&self, pipette: &PipetteHandle) -> Result<()> {
        (self.drop)(pipette.clone()).await
    }
}

/// Uses the pipette's own tip primitives and counts the tips used.
#[derive(Debug, Default)]
pub struct CountingTipHandler {
    picked: AtomicUsize,
}

impl CountingTipHandler {
    /// Handler with no tip used yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Tips picked up so far.
    pub fn tips_used(&self) -> usize {
        self.picked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TipHandler for CountingTipHandler {
    async fn pick_up(&self, pipette: &PipetteHandle) -> Result<()> {
        pipette.pick_up_tip().await?;
        let used = self.picked.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("{} picked up tip #{}", pipette, used);
        Ok(())
    }

    async fn drop_tip(&self, pipette: &PipetteHandle) -> Result<()> {
        pipette.drop_tip().await
    }
}
