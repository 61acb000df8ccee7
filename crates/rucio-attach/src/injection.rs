//! Pushes a batch of resolved variables into a kernel.
//!
//! One batch is one comm: open on [`KERNEL_COMM_TARGET`], send a single
//! `inject` message, close. Only after the close succeeds are the batch's
//! variable names recorded as injected for that kernel connection. Any
//! failure aborts the whole batch; a comm whose send failed is still closed.

use std::sync::Arc;

use log::{debug, info};

use crate::attachment::VariableInjection;
use crate::error::Result;
use crate::kernel::KernelConnection;
use crate::kernels::{KernelScope, KernelTable};
use crate::protocol::{KernelMessage, KERNEL_COMM_TARGET};

pub struct InjectionChannel {
    kernels: Arc<KernelTable>,
}

impl InjectionChannel {
    pub fn new(kernels: Arc<KernelTable>) -> Self {
        Self { kernels }
    }

    /// Send `injections` to `kernel` and record them under `scope`.
    ///
    /// Resolves immediately when `injections` is empty.
    pub async fn inject(
        &self,
        kernel: &dyn KernelConnection,
        scope: &KernelScope,
        injections: &[VariableInjection],
    ) -> Result<()> {
        if injections.is_empty() {
            return Ok(());
        }

        let comm = kernel.open_comm(KERNEL_COMM_TARGET).await?;
        debug!(
            "[injection] Opened comm {} on kernel {}",
            comm.comm_id(),
            kernel.id()
        );

        let message = KernelMessage::Inject {
            dids: injections.to_vec(),
        };
        if let Err(e) = comm.send(message.to_data()).await {
            if let Err(close_err) = comm.close().await {
                debug!(
                    "[injection] Failed to close comm {} after send error: {}",
                    comm.comm_id(),
                    close_err
                );
            }
            return Err(e);
        }
        comm.close().await?;

        let names: Vec<String> = injections
            .iter()
            .map(|i| i.variable_name.clone())
            .collect();
        if self.kernels.append_injected(scope, &names) {
            info!(
                "[injection] Injected {:?} into kernel {}",
                names,
                kernel.id()
            );
        } else {
            debug!(
                "[injection] Kernel {} was reset during injection, not recording {:?}",
                kernel.id(),
                names
            );
        }
        Ok(())
    }
}
