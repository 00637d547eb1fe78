// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Listener task: accepts socket connections and dispatches requests.
//!
//! Each connection gets its own task, so a slow client never blocks the
//! accept loop or other clients. `subscribe_events` turns its
//! connection into a dedicated event stream.

use crate::coordinator::Coordinator;
use crate::protocol::{self, ProtocolError, Request, Response, ScheduleKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use warden_core::schedule::ScheduleSpec;
use warden_core::{Clock, ControlError};
use warden_storage::LogQuery;

pub struct Listener<C: Clock> {
    unix: UnixListener,
    coordinator: Arc<Coordinator<C>>,
    shutdown: CancellationToken,
    /// Set by a `shutdown --kill` request; read by lifecycle teardown.
    kill: Arc<AtomicBool>,
}

impl<C: Clock> Listener<C> {
    pub fn new(
        unix: UnixListener,
        coordinator: Arc<Coordinator<C>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self { unix, coordinator, shutdown, kill: Arc::new(AtomicBool::new(false)) }
    }

    pub fn kill_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.kill)
    }

    /// Accept until shutdown; one task per connection.
    pub async fn run(self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.unix.accept() => match result {
                    Ok((stream, _)) => {
                        let coordinator = Arc::clone(&self.coordinator);
                        let shutdown = self.shutdown.clone();
                        let kill = Arc::clone(&self.kill);
                        tokio::spawn(async move {
                            let (reader, writer) = stream.into_split();
                            let conn = Connection { coordinator, shutdown, kill };
                            if let Err(e) = conn.serve(reader, writer).await {
                                log_connection_error(e);
                            }
                        });
                    }
                    Err(e) => error!("accept error: {e}"),
                },
            }
        }
    }
}

fn log_connection_error(e: ProtocolError) {
    match e {
        ProtocolError::ConnectionClosed => debug!("client disconnected"),
        other => warn!("connection error: {other}"),
    }
}

struct Connection<C: Clock> {
    coordinator: Arc<Coordinator<C>>,
    shutdown: CancellationToken,
    kill: Arc<AtomicBool>,
}

impl<C: Clock> Connection<C> {
    async fn serve<R, W>(&self, mut reader: R, mut writer: W) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            let request: Request = protocol::read_typed(&mut reader).await?;
            match request {
                Request::SubscribeEvents { workload } => {
                    return self.stream_events(workload, writer).await;
                }
                Request::Shutdown { kill } => {
                    self.kill.store(kill, Ordering::Relaxed);
                    protocol::write_typed(&mut writer, &Response::Ok).await?;
                    self.shutdown.cancel();
                    return Ok(());
                }
                request => {
                    let response = self.dispatch(request).await;
                    protocol::write_typed(&mut writer, &response).await?;
                }
            }
        }
    }

    /// Dedicated event stream until the client goes away.
    async fn stream_events<W>(
        &self,
        workload: Option<String>,
        mut writer: W,
    ) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let (id, mut rx) = match self.coordinator.subscribe(workload.as_deref()) {
            Ok(sub) => sub,
            Err(error) => {
                return protocol::write_typed(&mut writer, &Response::error(error)).await;
            }
        };
        protocol::write_typed(&mut writer, &Response::Ok).await?;

        let result = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                event = rx.recv() => match event {
                    // None: the fan dropped us for lagging.
                    None => break Ok(()),
                    Some(event) => {
                        if let Err(e) =
                            protocol::write_typed(&mut writer, &Response::Event { event }).await
                        {
                            break Err(e);
                        }
                    }
                },
            }
        };
        self.coordinator.unsubscribe(id);
        result
    }

    async fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::Ping => Response::Pong { version: crate::env::PROTOCOL_VERSION.to_string() },
            Request::Hello { version } => {
                if version != crate::env::PROTOCOL_VERSION {
                    debug!(client = %version, daemon = crate::env::PROTOCOL_VERSION, "version skew");
                }
                Response::Pong { version: crate::env::PROTOCOL_VERSION.to_string() }
            }
            Request::CreateWorkload { name, argv, cwd, env, group, policy, schedules } => {
                let mut specs = Vec::new();
                for (kind, expression) in schedules {
                    match parse_schedule_spec(kind, &expression) {
                        Ok(spec) => specs.push(spec),
                        Err(error) => return Response::error(error),
                    }
                }
                self.coordinator
                    .create_workload(name, argv, cwd, env, group, policy, specs)
                    .await
                    .map(|id| Response::Created { id: id.as_str().to_string() })
                    .into()
            }
            Request::UpdateWorkload { id, fields } => {
                self.coordinator.update_workload(&id, fields).await.map(|_| Response::Ok).into()
            }
            Request::DeleteWorkload { id, force } => {
                self.coordinator.delete_workload(&id, force).await.map(|_| Response::Ok).into()
            }
            Request::Start { id } => self.coordinator.start(&id).await.map(|_| Response::Ok).into(),
            Request::Stop { id, grace, force } => {
                let grace = match grace.map(|g| parse_wire_duration(&g)).transpose() {
                    Ok(grace) => grace,
                    Err(error) => return Response::error(error),
                };
                self.coordinator.stop(&id, grace, force).await.map(|_| Response::Ok).into()
            }
            Request::Restart { id, delay } => {
                let delay = match delay.map(|d| parse_wire_duration(&d)).transpose() {
                    Ok(delay) => delay,
                    Err(error) => return Response::error(error),
                };
                self.coordinator.restart(&id, delay).await.map(|_| Response::Ok).into()
            }
            Request::ListWorkloads { filter } => {
                Response::Workloads { items: self.coordinator.list_workloads(filter.as_deref()) }
            }
            Request::Describe { id } => self
                .coordinator
                .describe(&id)
                .map(|detail| Response::Workload { detail: Box::new(detail) })
                .into(),
            Request::PutPolicy { policy } => {
                self.coordinator.put_policy(policy).await.map(|_| Response::Ok).into()
            }
            Request::PutSchedule { id, kind, expression, enabled } => {
                let spec = match parse_schedule_spec(kind, &expression) {
                    Ok(spec) => spec,
                    Err(error) => return Response::error(error),
                };
                self.coordinator
                    .put_schedule(&id, spec, enabled)
                    .await
                    .map(|schedule_id| Response::ScheduleCreated {
                        schedule_id: schedule_id.as_str().to_string(),
                    })
                    .into()
            }
            Request::EnableSchedule { schedule_id } => self
                .coordinator
                .set_schedule_enabled(&schedule_id, true)
                .await
                .map(|_| Response::Ok)
                .into(),
            Request::DisableSchedule { schedule_id } => self
                .coordinator
                .set_schedule_enabled(&schedule_id, false)
                .await
                .map(|_| Response::Ok)
                .into(),
            Request::QueryLogs { id, since_ms, until_ms, stream, grep, tail } => {
                let query = LogQuery { since_ms, until_ms, stream, grep, tail };
                self.coordinator
                    .query_logs(&id, &query)
                    .map(|records| Response::Logs { records })
                    .into()
            }
            Request::QueryMetrics { id, since_ms, until_ms } => self
                .coordinator
                .query_metrics(&id, since_ms, until_ms)
                .map(|samples| Response::Metrics { samples })
                .into(),
            Request::Health => Response::Health { report: self.coordinator.health() },
            // Handled in serve(); unreachable here.
            Request::SubscribeEvents { .. } | Request::Shutdown { .. } => Response::Ok,
        }
    }
}

fn parse_wire_duration(text: &str) -> Result<Duration, ControlError> {
    warden_core::parse_duration(text)
        .map_err(|e| ControlError::invalid_field(format!("invalid duration {text:?}: {e}")))
}

/// Interpret a wire `(kind, expression)` pair.
fn parse_schedule_spec(kind: ScheduleKind, expression: &str) -> Result<ScheduleSpec, ControlError> {
    match kind {
        ScheduleKind::Cron => Ok(ScheduleSpec::Cron { expr: expression.to_string() }),
        ScheduleKind::Interval => {
            let every = warden_core::parse_duration(expression).map_err(|e| {
                ControlError::invalid_expression(format!("invalid interval {expression:?}: {e}"))
            })?;
            Ok(ScheduleSpec::Interval { every_ms: every.as_millis() as u64 })
        }
        ScheduleKind::Once => {
            let instant = chrono::DateTime::parse_from_rfc3339(expression).map_err(|e| {
                ControlError::invalid_expression(format!("invalid instant {expression:?}: {e}"))
            })?;
            Ok(ScheduleSpec::Once { at_ms: instant.timestamp_millis().max(0) as u64 })
        }
    }
}

#[cfg(test)]
#[path = "listener_tests.rs"]
mod tests;
