//! Drives the interception core with a simulated guest.
//!
//! A UART is mapped as MMIO and a frame buffer is write-tracked. The guest
//! then spins on a port I/O loop, which the exit history picks up and
//! hands to the execution policy.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use vmexit::{
    ExecBackend, ExecLimits, ExecStats, HaltSignal, HandlerKind, Hpa, InterceptError, Pa,
    PageProtectionChange, PageType, ProtectionNotifier, VcpuId,
    handlers::{
        AccessOutcome, AccessType, HandlerConfig, HandlerContext, HandlerTypeFlags, HandlerUser,
        PhysAccess, PhysAccessHandler, PhysHandlers,
    },
    history::{ExitFlagsAndType, ExitKind, HistoryConfig, VcpuExitHistory, em},
};

/// Logs protection changes instead of applying them.
struct TracingNotifier;

impl ProtectionNotifier for TracingNotifier {
    fn page_protection_changed(&self, change: &PageProtectionChange) -> Result<(), InterceptError> {
        tracing::info!(
            address = %change.address,
            host = %change.host,
            protection = %change.protection,
            state = %change.state,
            "protection changed"
        );

        Ok(())
    }
}

/// A UART that echoes the transmit register.
#[derive(Default)]
struct Uart {
    transmitted: AtomicU64,
}

impl PhysAccessHandler for Uart {
    fn handle(
        &self,
        _ctx: HandlerContext<'_>,
        access: &mut PhysAccess<'_>,
        user: HandlerUser,
    ) -> Result<AccessOutcome, InterceptError> {
        match access.access_type() {
            AccessType::Write => {
                self.transmitted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(port = user.raw(), byte = ?access.buffer(), "uart transmit");
            }
            AccessType::Read => access.buffer_mut().fill(0x60),
        }

        Ok(AccessOutcome::Handled)
    }
}

/// A frame buffer whose writes only mark it dirty.
struct FrameBuffer;

impl PhysAccessHandler for FrameBuffer {
    fn handle(
        &self,
        _ctx: HandlerContext<'_>,
        _access: &mut PhysAccess<'_>,
        _user: HandlerUser,
    ) -> Result<AccessOutcome, InterceptError> {
        Ok(AccessOutcome::Default)
    }
}

/// An interpreter that pretends to run a tight `out` loop: every fourth
/// instruction would exit.
struct Interpreter;

impl ExecBackend for Interpreter {
    fn can_exec_with_max(&self) -> bool {
        true
    }

    fn exec_for_exits(
        &mut self,
        _will_exit: bool,
        limits: ExecLimits,
        halt: &HaltSignal,
    ) -> Result<ExecStats, InterceptError> {
        if halt.is_raised() {
            return Ok(ExecStats {
                abandoned: true,
                ..ExecStats::default()
            });
        }

        let instructions = limits
            .min_instructions
            .max(u32::from(limits.max_instructions_without_exit) * 8)
            .min(limits.max_instructions);

        Ok(ExecStats {
            instructions,
            exits: instructions / 4,
            max_exit_distance: 4,
            abandoned: false,
        })
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .init();

    // Setup the physical handler registry.
    let handlers =
        PhysHandlers::new(HandlerConfig::default()).with_notifier(Arc::new(TracingNotifier));

    handlers.register_ram(Pa(0), 256, Hpa(0x1_0000_0000), PageType::Ram, "low memory")?;
    handlers.register_ram(Pa(0xfe00_0000), 16, Hpa(0), PageType::Mmio, "mmio hole")?;

    let uart = Arc::new(Uart::default());
    let uart_type =
        handlers.register_type(HandlerKind::Mmio, HandlerTypeFlags::empty(), uart.clone(), "uart")?;
    let fb_type = handlers.register_type(
        HandlerKind::Write,
        HandlerTypeFlags::NOT_IN_ACCEL,
        Arc::new(FrameBuffer),
        "frame buffer",
    )?;

    handlers.register(Pa(0xfe00_0000), Pa(0xfe00_0fff), uart_type, 0x3f8, "com1")?;
    handlers.register(Pa(0xa_0000), Pa(0xb_ffff), fb_type, 0, "vga")?;

    // Route a couple of accesses.
    let mut byte = [b'A'];
    let outcome = handlers.handle_access(&mut PhysAccess::new(
        VcpuId(0),
        Pa(0xfe00_0000),
        AccessType::Write,
        &mut byte,
    ))?;
    tracing::info!(?outcome, "uart write");

    let mut pixel = [0u8; 4];
    let outcome = handlers.handle_access(&mut PhysAccess::new(
        VcpuId(0),
        Pa(0xa_1000),
        AccessType::Write,
        &mut pixel,
    ))?;
    tracing::info!(?outcome, "frame buffer write");

    // Spin the guest on a port loop.
    let mut history = VcpuExitHistory::new(VcpuId(0), HistoryConfig::default())?;
    let mut backend = Interpreter;
    let port_write = ExitFlagsAndType::new(ExitKind::Em, em::IO_PORT_WRITE);

    for timestamp in 0..64 {
        let Some(result) = history.on_exit(port_write, 0x7c00, timestamp, &mut backend, true)? else {
            continue;
        };

        tracing::debug!(
            timestamp,
            action = %result.action,
            instructions = result.stats.instructions,
            "exit handled"
        );
    }

    println!("{:#?}", history.engine().stats());
    println!("{:#?}", history.cache().stats());
    println!("uart bytes: {}", uart.transmitted.load(Ordering::Relaxed));
    println!("stale pages: {}", handlers.verify_page_states());

    Ok(())
}
