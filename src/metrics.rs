//! Prometheus metrics registry and scrape endpoint.
//!
//! The control loop publishes one snapshot per tick; the HTTP side runs on
//! its own thread and only ever reads the registry. Gauge updates are atomic
//! per instrument, not per tick.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tiny_http::{Header, Response, Server};
use tracing::{error, info, warn};

use crate::control::pid::PidTerms;
use crate::control::runner::EmergencyReason;

/// Every reason label is written each tick so a cleared emergency never
/// leaves a stale 1 behind.
const EMERGENCY_REASONS: [&str; 3] = ["cpu_temp", "hdd_temp", "ipmi_failure"];

pub struct Metrics {
    registry: Registry,

    hdd_temperature: GaugeVec,
    hdd_temperature_max: Gauge,
    hdd_temperature_avg: Gauge,
    cpu_temperature: Gauge,

    fan_duty_percent: Gauge,
    fan_speed_rpm: GaugeVec,

    pid_proportional: Gauge,
    pid_integral: Gauge,
    pid_derivative: Gauge,
    pid_error: Gauge,

    emergency_mode: GaugeVec,
    errors_total: CounterVec,
    loop_duration: Histogram,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let hdd_temperature = GaugeVec::new(
            Opts::new(
                "fan_controller_hdd_temperature_celsius",
                "HDD temperature in Celsius",
            ),
            &["disk"],
        )?;
        let hdd_temperature_max = Gauge::with_opts(Opts::new(
            "fan_controller_hdd_temperature_max_celsius",
            "Maximum HDD temperature in Celsius",
        ))?;
        let hdd_temperature_avg = Gauge::with_opts(Opts::new(
            "fan_controller_hdd_temperature_avg_celsius",
            "Average temperature of warmest disks in Celsius",
        ))?;
        let cpu_temperature = Gauge::with_opts(Opts::new(
            "fan_controller_cpu_temperature_celsius",
            "CPU temperature in Celsius",
        ))?;

        let fan_duty_percent = Gauge::with_opts(Opts::new(
            "fan_controller_fan_duty_percent",
            "Current fan duty cycle percentage",
        ))?;
        let fan_speed_rpm = GaugeVec::new(
            Opts::new("fan_controller_fan_speed_rpm", "Fan speed in RPM"),
            &["fan"],
        )?;

        let pid_proportional = Gauge::with_opts(Opts::new(
            "fan_controller_pid_proportional",
            "PID proportional term",
        ))?;
        let pid_integral = Gauge::with_opts(Opts::new(
            "fan_controller_pid_integral",
            "PID integral term",
        ))?;
        let pid_derivative = Gauge::with_opts(Opts::new(
            "fan_controller_pid_derivative",
            "PID derivative term",
        ))?;
        let pid_error = Gauge::with_opts(Opts::new(
            "fan_controller_pid_error_celsius",
            "PID error in Celsius",
        ))?;

        let emergency_mode = GaugeVec::new(
            Opts::new(
                "fan_controller_emergency_mode",
                "Emergency mode status (1=active, 0=normal)",
            ),
            &["reason"],
        )?;
        let errors_total = CounterVec::new(
            Opts::new("fan_controller_errors_total", "Total number of errors by type"),
            &["type"],
        )?;
        let loop_duration = Histogram::with_opts(
            HistogramOpts::new(
                "fan_controller_loop_duration_seconds",
                "Control loop execution time in seconds",
            )
            .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
        )?;

        registry.register(Box::new(hdd_temperature.clone()))?;
        registry.register(Box::new(hdd_temperature_max.clone()))?;
        registry.register(Box::new(hdd_temperature_avg.clone()))?;
        registry.register(Box::new(cpu_temperature.clone()))?;
        registry.register(Box::new(fan_duty_percent.clone()))?;
        registry.register(Box::new(fan_speed_rpm.clone()))?;
        registry.register(Box::new(pid_proportional.clone()))?;
        registry.register(Box::new(pid_integral.clone()))?;
        registry.register(Box::new(pid_derivative.clone()))?;
        registry.register(Box::new(pid_error.clone()))?;
        registry.register(Box::new(emergency_mode.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(loop_duration.clone()))?;

        Ok(Self {
            registry,
            hdd_temperature,
            hdd_temperature_max,
            hdd_temperature_avg,
            cpu_temperature,
            fan_duty_percent,
            fan_speed_rpm,
            pid_proportional,
            pid_integral,
            pid_derivative,
            pid_error,
            emergency_mode,
            errors_total,
            loop_duration,
            start_time: Instant::now(),
        })
    }

    /// Publish the complete snapshot of one control-loop tick.
    #[allow(clippy::too_many_arguments)]
    pub fn update_tick(
        &self,
        disk_temps: &HashMap<String, i64>,
        cpu_temp: f64,
        fan_speeds: &HashMap<String, i64>,
        fan_duty: i64,
        pid_terms: &PidTerms,
        avg_temp: f64,
        max_temp: i64,
        emergency: Option<EmergencyReason>,
        loop_duration: Duration,
    ) {
        for (disk, temp) in disk_temps {
            self.hdd_temperature
                .with_label_values(&[disk])
                .set(*temp as f64);
        }

        self.hdd_temperature_max.set(max_temp as f64);
        self.hdd_temperature_avg.set(avg_temp);
        self.cpu_temperature.set(cpu_temp);

        self.fan_duty_percent.set(fan_duty as f64);
        for (fan, rpm) in fan_speeds {
            self.fan_speed_rpm.with_label_values(&[fan]).set(*rpm as f64);
        }

        self.pid_proportional.set(pid_terms.p);
        self.pid_integral.set(pid_terms.i);
        self.pid_derivative.set(pid_terms.d);
        self.pid_error.set(pid_terms.error);

        let active = emergency.map(EmergencyReason::as_str);
        for reason in EMERGENCY_REASONS {
            let value = if active == Some(reason) { 1.0 } else { 0.0 };
            self.emergency_mode.with_label_values(&[reason]).set(value);
        }

        self.loop_duration.observe(loop_duration.as_secs_f64());
    }

    /// Increment the error counter for the given type (`temperature`, `ipmi`).
    pub fn record_error(&self, error_type: &str) {
        self.errors_total.with_label_values(&[error_type]).inc();
    }

    fn render_exposition(&self) -> Response<Cursor<Vec<u8>>> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            error!("failed to encode metrics: {}", e);
            return Response::from_string("encoding error").with_status_code(500);
        }

        Response::from_data(buffer).with_header(
            Header::from_bytes(b"Content-Type", b"text/plain; version=0.0.4").unwrap(),
        )
    }

    fn render_health(&self) -> Response<Cursor<Vec<u8>>> {
        let uptime = self.start_time.elapsed();
        let body = serde_json::json!({
            "status": "ok",
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "uptime": humantime::format_duration(Duration::from_secs(uptime.as_secs())).to_string(),
        });

        Response::from_string(body.to_string())
            .with_header(Header::from_bytes(b"Content-Type", b"application/json").unwrap())
    }

}

/// Bind the metrics port and serve /metrics and /health on a dedicated
/// thread. The server only reads published instruments; it never calls back
/// into the control loop.
pub fn spawn_server(metrics: Arc<Metrics>, port: u16) -> Result<()> {
    let server = Server::http(("0.0.0.0", port))
        .map_err(|e| anyhow!("failed to bind metrics server on port {}: {}", port, e))
        .context("metrics server startup")?;

    info!("metrics server listening on :{}", port);

    std::thread::spawn(move || {
        for request in server.incoming_requests() {
            let url = request.url();
            let response = if url.starts_with("/metrics") {
                metrics.render_exposition()
            } else if url.starts_with("/health") {
                metrics.render_health()
            } else {
                Response::from_string("not found").with_status_code(404)
            };

            if let Err(e) = request.respond(response) {
                warn!("failed to respond to metrics request: {}", e);
            }
        }
    });

    Ok(())
}
