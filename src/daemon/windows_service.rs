//! Service Control Manager integration.
//!
//! `autoinstall service` is the command line registered with the SCM; it
//! hands control to the dispatcher, which runs the daemon until a Stop
//! control arrives.

use std::ffi::OsString;
use std::sync::mpsc;
use std::time::Duration;

use windows_service::{
    define_windows_service,
    service::{
        ServiceControl, ServiceControlAccept, ServiceExitCode, ServiceState, ServiceStatus,
        ServiceType,
    },
    service_control_handler::{self, ServiceControlHandlerResult, ServiceStatusHandle},
    service_dispatcher,
};

/// Name the service is registered under.
pub const SERVICE_NAME: &str = "AutoInstall";

define_windows_service!(ffi_service_main, service_main);

/// Blocks until the service is stopped.
pub fn run() -> windows_service::Result<()> {
    service_dispatcher::start(SERVICE_NAME, ffi_service_main)
}

fn service_main(_arguments: Vec<OsString>) {
    // The daemon installs the file logger itself once the data dir is known.
    if let Err(e) = run_service() {
        tracing::error!("Service failed: {:?}", e);
    }
}

fn report(
    handle: &ServiceStatusHandle,
    state: ServiceState,
    accept: ServiceControlAccept,
    exit_code: u32,
    wait_hint: Duration,
) -> windows_service::Result<()> {
    handle.set_service_status(ServiceStatus {
        service_type: ServiceType::OWN_PROCESS,
        current_state: state,
        controls_accepted: accept,
        exit_code: ServiceExitCode::Win32(exit_code),
        checkpoint: 0,
        wait_hint,
        process_id: None,
    })
}

fn run_service() -> windows_service::Result<()> {
    let (shutdown_tx, shutdown_rx) = mpsc::channel();

    let event_handler = move |control_event| -> ServiceControlHandlerResult {
        match control_event {
            ServiceControl::Stop | ServiceControl::Shutdown => {
                tracing::info!("Received stop request from the service manager");
                let _ = shutdown_tx.send(());
                ServiceControlHandlerResult::NoError
            }
            ServiceControl::Interrogate => ServiceControlHandlerResult::NoError,
            _ => ServiceControlHandlerResult::NotImplemented,
        }
    };

    let status_handle = service_control_handler::register(SERVICE_NAME, event_handler)?;
    report(
        &status_handle,
        ServiceState::StartPending,
        ServiceControlAccept::empty(),
        0,
        Duration::from_secs(10),
    )?;

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to create Tokio runtime: {}", e);
            return report(
                &status_handle,
                ServiceState::Stopped,
                ServiceControlAccept::empty(),
                1,
                Duration::default(),
            );
        }
    };

    report(
        &status_handle,
        ServiceState::Running,
        ServiceControlAccept::STOP | ServiceControlAccept::SHUTDOWN,
        0,
        Duration::default(),
    )?;

    let exit_code = rt.block_on(async {
        match super::run_daemon_until_shutdown(shutdown_rx).await {
            Ok(()) => 0u32,
            Err(e) => {
                tracing::error!("Daemon error: {:#}", e);
                1u32
            }
        }
    });

    report(
        &status_handle,
        ServiceState::StopPending,
        ServiceControlAccept::empty(),
        exit_code,
        Duration::from_secs(10),
    )?;
    report(
        &status_handle,
        ServiceState::Stopped,
        ServiceControlAccept::empty(),
        exit_code,
        Duration::default(),
    )
}
