use crate::error::Result;
use crate::status::{self, ChargerStatus, StatusInputs};

impl super::ChargerEngine {
    #[allow(clippy::cognitive_complexity)]
    pub(crate) async fn poll_cycle(&mut self) -> Result<()> {
        self.logger.debug("Starting poll cycle");
        if self.modbus_manager.is_none() {
            self.logger.debug("Poll cycle completed (no Modbus manager)");
            let snapshot = std::sync::Arc::new(self.build_typed_snapshot(Some(self.last_poll_duration_ms())));
            let _ = self.status_snapshot_tx.send(snapshot);
            return Ok(());
        }

        let socket_id = self.config.modbus.socket_slave_id;
        let addr_voltages = self.config.registers.voltages;
        let addr_currents = self.config.registers.currents;
        let addr_power = self.config.registers.power;
        let addr_energy = self.config.registers.energy;
        let addr_status = self.config.registers.status;
        let addr_amps = self.config.registers.amps_config;
        let addr_phases = self.config.registers.phases;
        let station_id = self.config.modbus.station_slave_id;
        let addr_station_max = self.config.registers.station_max_current;

        let manager = self.modbus_manager.as_mut().unwrap();

        // One contiguous read spanning voltages through the energy counter,
        // and one spanning the status string through the phase-count
        // register, rather than a separate round trip per field.
        let measurement_window_len = addr_energy.saturating_sub(addr_voltages).saturating_add(4);
        let measurements = manager
            .read_holding_registers(socket_id, addr_voltages, measurement_window_len)
            .await
            .ok();

        let control_window_len = addr_phases.saturating_sub(addr_status).saturating_add(1);
        let control = manager
            .read_holding_registers(station_id, addr_status, control_window_len)
            .await
            .ok();

        if let Ok(max_regs) = manager
            .read_holding_registers(station_id, addr_station_max, 2)
            .await
            && max_regs.len() >= 2
            && let Ok(max_c) = crate::modbus::decode_32bit_float(&max_regs[0..2])
            && max_c.is_finite()
            && max_c > 0.0
        {
            self.station_max_current = max_c;
        }

        // Offsets within `measurements`, relative to `addr_voltages`.
        let off_currents = addr_currents.saturating_sub(addr_voltages) as usize;
        let off_power = addr_power.saturating_sub(addr_voltages) as usize;
        let off_energy = addr_energy.saturating_sub(addr_voltages) as usize;

        let voltages = measurements
            .as_deref()
            .filter(|v| v.len() >= 6)
            .map(|v| &v[0..6]);
        let currents = measurements
            .as_deref()
            .filter(|v| v.len() >= off_currents + 6)
            .map(|v| &v[off_currents..off_currents + 6]);
        let power_regs = measurements
            .as_deref()
            .filter(|v| v.len() >= off_power + 8)
            .map(|v| &v[off_power..off_power + 8]);
        let energy_regs = measurements
            .as_deref()
            .filter(|v| v.len() >= off_energy + 4)
            .map(|v| &v[off_energy..off_energy + 4]);

        // Offsets within `control`, relative to `addr_status`.
        let off_phases = addr_phases.saturating_sub(addr_status) as usize;
        let status_regs = control.as_deref().filter(|v| v.len() >= 5).map(|v| &v[0..5]);
        let phases_reg = control
            .as_deref()
            .filter(|v| v.len() > off_phases)
            .map(|v| v[off_phases]);

        let (l1_v, l2_v, l3_v) = match voltages {
            Some(v) if v.len() >= 6 => (
                crate::modbus::decode_32bit_float(&v[0..2]).unwrap_or(0.0) as f64,
                crate::modbus::decode_32bit_float(&v[2..4]).unwrap_or(0.0) as f64,
                crate::modbus::decode_32bit_float(&v[4..6]).unwrap_or(0.0) as f64,
            ),
            _ => (0.0, 0.0, 0.0),
        };

        let (l1_i, l2_i, l3_i) = match currents {
            Some(v) if v.len() >= 6 => (
                crate::modbus::decode_32bit_float(&v[0..2]).unwrap_or(0.0) as f64,
                crate::modbus::decode_32bit_float(&v[2..4]).unwrap_or(0.0) as f64,
                crate::modbus::decode_32bit_float(&v[4..6]).unwrap_or(0.0) as f64,
            ),
            _ => (0.0, 0.0, 0.0),
        };

        let (mut l1_p, mut l2_p, mut l3_p, mut p_total) = match power_regs {
            Some(v) if v.len() >= 8 => {
                let p1 = crate::modbus::decode_32bit_float(&v[0..2]).unwrap_or(0.0) as f64;
                let p2 = crate::modbus::decode_32bit_float(&v[2..4]).unwrap_or(0.0) as f64;
                let p3 = crate::modbus::decode_32bit_float(&v[4..6]).unwrap_or(0.0) as f64;
                let pt = crate::modbus::decode_32bit_float(&v[6..8]).unwrap_or(0.0) as f64;
                let sanitize = |x: f64| if x.is_finite() { x } else { 0.0 };
                (sanitize(p1), sanitize(p2), sanitize(p3), sanitize(pt))
            }
            _ => (0.0, 0.0, 0.0, 0.0),
        };

        let approx = |v: f64, i: f64| (v * i).round();
        if l1_p.abs() < 1.0 {
            l1_p = approx(l1_v, l1_i);
        }
        if l2_p.abs() < 1.0 {
            l2_p = approx(l2_v, l2_i);
        }
        if l3_p.abs() < 1.0 {
            l3_p = approx(l3_v, l3_i);
        }
        if p_total.abs() < 1.0 {
            p_total = l1_p + l2_p + l3_p;
        }

        let energy_wh = match energy_regs {
            Some(v) if v.len() >= 4 => crate::modbus::decode_64bit_float(&v[0..4]).unwrap_or(0.0),
            _ => 0.0,
        };
        let energy_kwh = energy_wh / 1000.0;

        let mode3 = match status_regs {
            Some(v) if v.len() >= 5 => crate::modbus::decode_string(&v[0..5], None).unwrap_or_default(),
            _ => String::new(),
        };

        let requested = self.intended_set_current;

        let ev_power_for_subtract = {
            let lag_ms = self.config.controls.ev_reporting_lag_ms as u128;
            if self.last_set_current_monotonic.elapsed().as_millis() < lag_ms {
                let phases = 3.0f64;
                (self.last_sent_current as f64 * 230.0f64 * phases).max(0.0)
            } else {
                p_total
            }
        };
        let excess_pv_power_w: f32 = self
            .calculate_excess_pv_power(ev_power_for_subtract)
            .await
            .unwrap_or(0.0);
        self.last_excess_pv_power_w = excess_pv_power_w;

        // Phase count is inferred from the register rather than our own last
        // write, so a charger-side change (or a write that didn't land) is
        // reflected promptly. The NG9xx register manual doesn't document a
        // value of 2, but field units have been observed reporting it; it's
        // coerced to 3 and tracked in a counter for field debugging.
        let assumed_phases = match phases_reg {
            Some(1) => 1,
            Some(3) => 3,
            Some(2) => {
                self.phase_value2_coerced_count += 1;
                self.logger.debug(&format!(
                    "Phase register reported 2, coercing to 3 (seen {} times)",
                    self.phase_value2_coerced_count
                ));
                3
            }
            _ => {
                if self.applied_phases >= 3 {
                    3
                } else {
                    1
                }
            }
        };
        self.applied_phases = assumed_phases;

        let raw_effective: f32 = self
            .controls
            .compute_effective_current(
                self.current_mode,
                self.start_stop,
                requested,
                self.station_max_current,
                Some(excess_pv_power_w),
                &self.config,
                assumed_phases,
            )
            .await
            .unwrap_or(0.0);

        // In AUTO, gate start/stop with hysteresis so marginal PV excess
        // doesn't make the charger chatter on and off.
        let effective = if matches!(self.current_mode, crate::controls::ChargingMode::Auto) {
            let dt = self.last_current_set_time.elapsed().as_secs_f32().max(0.0);
            let currently_enabled = self.last_sent_current > 0.01;
            let enabled = self.auto_hold.advance(
                raw_effective,
                self.config.controls.min_set_current,
                dt,
                currently_enabled,
                self.config.controls.enable_hold_seconds as f32,
                self.config.controls.disable_hold_seconds as f32,
            );
            if enabled { raw_effective } else { 0.0 }
        } else {
            raw_effective
        };

        let battery_soc = self.read_battery_soc().await;
        let soc_below_minimum = battery_soc
            .map(|soc| soc < self.config.controls.min_soc)
            .unwrap_or(false);
        // AUTO skips to 0 A whenever the battery SOC is known and below the
        // configured minimum, regardless of how much excess PV is available.
        let effective = if matches!(self.current_mode, crate::controls::ChargingMode::Auto) && soc_below_minimum {
            0.0
        } else {
            effective
        };

        // Phase selection (§4.5): derive the desired phase count from the
        // setpoint just computed and, if it differs from what's applied,
        // kick off a switch. `apply_phases_now` is itself rate-limited and
        // non-blocking, so this is safe to call every tick.
        let desired_phase_count = crate::controls::desired_phase_count(
            effective,
            self.applied_phases,
            matches!(self.current_mode, crate::controls::ChargingMode::Auto),
            &self.config.controls,
        );
        if desired_phase_count != self.applied_phases || self.phase_switch_to.is_some() {
            self.desired_phases = desired_phase_count;
            let _ = self.apply_phases_now(desired_phase_count).await;
        }

        let watchdog_satisfied = self.last_current_set_time.elapsed().as_millis()
            >= self.config.controls.current_update_interval as u128;
        let need_watchdog = watchdog_satisfied
            || self.last_current_set_time.elapsed().as_secs()
                >= self.config.controls.watchdog_interval_seconds as u64;
        let need_change = (effective - self.last_sent_current).abs()
            > self.config.controls.update_difference_threshold;

        if need_watchdog || need_change {
            if need_change {
                let reason = match self.current_mode {
                    crate::controls::ChargingMode::Manual => "manual",
                    crate::controls::ChargingMode::Auto => "pv_auto",
                    crate::controls::ChargingMode::Scheduled => "scheduled",
                };
                self.logger.info(&format!(
                    "Adjusting available current: {:.2} A -> {:.2} A (reason={}, pv_excess={:.0} W, station_max={:.1} A)",
                    self.last_sent_current, effective, reason, excess_pv_power_w, self.station_max_current
                ));
            }
            let regs = crate::modbus::encode_32bit_float(effective);
            let write_res = self
                .modbus_manager
                .as_mut()
                .unwrap()
                .write_multiple_registers(socket_id, addr_amps, &regs)
                .await;

            match write_res {
                Ok(()) => {
                    if let Err(e) = self.verify_applied_current(effective).await {
                        self.logger.warn(&format!("Write verification failed: {}", e));
                    }
                    self.last_sent_current = effective;
                    self.last_current_set_time = std::time::Instant::now();
                    self.last_set_current_monotonic = std::time::Instant::now();
                    self.persistence
                        .set_last_applied(effective, self.applied_phases);
                }
                Err(e) => {
                    self.logger
                        .warn(&format!("Failed to write set current via Modbus: {}", e));
                }
            }
        }

        let real_power_w = p_total as f32;
        let currently_charging = self.last_sent_current > 0.05;
        if currently_charging && real_power_w < status::CHARGED_POWER_THRESHOLD_W {
            if self.low_power_hold_since.is_none() {
                self.low_power_hold_since = Some(std::time::Instant::now());
            }
        } else {
            self.low_power_hold_since = None;
        }
        let low_power_hold_seconds = self
            .low_power_hold_since
            .map(|t| t.elapsed().as_secs_f32())
            .unwrap_or(0.0);

        let waiting_for_solar = matches!(self.current_mode, crate::controls::ChargingMode::Auto)
            && effective < 0.01
            && excess_pv_power_w < self.config.controls.min_set_current * 230.0;
        let waiting_for_schedule = matches!(self.current_mode, crate::controls::ChargingMode::Scheduled)
            && effective < 0.01;

        let canonical = status::derive(
            &mode3,
            StatusInputs {
                mode3: None,
                applied_current_a: self.last_sent_current,
                real_power_w,
                low_power_hold_seconds,
                is_auto_mode: matches!(self.current_mode, crate::controls::ChargingMode::Auto),
                is_scheduled_mode: matches!(self.current_mode, crate::controls::ChargingMode::Scheduled),
                waiting_for_solar,
                waiting_for_schedule,
                soc_below_minimum,
            },
        );
        let cur_status = canonical;

        let rate = if self.config.pricing.source.to_lowercase() == "static" {
            Some(self.config.pricing.static_rate_eur_per_kwh)
        } else {
            None
        };

        if cur_status == ChargerStatus::Charging && self.sessions.current_session.is_none() {
            let _ = self.sessions.start_session(energy_kwh);
        }
        self.sessions.update(p_total, energy_kwh, rate);
        if cur_status != ChargerStatus::Charging && self.sessions.current_session.is_some() {
            let _ = self.sessions.end_session(energy_kwh);
        }

        let cur_status_code = cur_status.victron_code();
        self.last_status = cur_status_code;

        self.persistence.set_mode(self.current_mode as u32);
        self.persistence.set_start_stop(self.start_stop as u32);
        self.persistence.set_set_current(self.intended_set_current);
        self.persistence.set_last_status(cur_status.as_str());
        let _ = self
            .persistence
            .set_section("session", self.sessions.get_state());
        let _ = self.persistence.save();

        if let Some(dbus) = &self.dbus {
            let _ = dbus
                .lock()
                .await
                .update_paths([
                    ("/Status".to_string(), serde_json::json!(cur_status_code)),
                    ("/Ac/Power".to_string(), serde_json::json!(p_total)),
                    ("/Ac/Current".to_string(), serde_json::json!(l1_i.max(l2_i.max(l3_i)))),
                    ("/Ac/Energy/Forward".to_string(), serde_json::json!(energy_kwh)),
                ])
                .await;
        }

        self.last_l1_voltage = l1_v;
        self.last_l2_voltage = l2_v;
        self.last_l3_voltage = l3_v;
        self.last_l1_current = l1_i;
        self.last_l2_current = l2_i;
        self.last_l3_current = l3_i;
        self.last_l1_power = l1_p;
        self.last_l2_power = l2_p;
        self.last_l3_power = l3_p;
        self.last_total_power = p_total;
        self.last_energy_kwh = energy_kwh;

        self.logger.debug(&format!(
            "V=({:.1},{:.1},{:.1})V I=({:.2},{:.2},{:.2})A P=({:.0},{:.0},{:.0})W total={:.0}W E={:.3}kWh status={} lag_ms={} last_sent_A={:.2}",
            l1_v, l2_v, l3_v, l1_i, l2_i, l3_i, l1_p, l2_p, l3_p, p_total, energy_kwh, cur_status.as_str(),
            self.last_set_current_monotonic.elapsed().as_millis(), self.last_sent_current
        ));

        let mut status_obj = serde_json::json!({
            "mode": self.current_mode_code(),
            "start_stop": self.start_stop_code(),
            "set_current": self.get_intended_set_current(),
            "applied_current": effective,
            "station_max_current": self.get_station_max_current(),
            "ac_power": p_total,
            "status": cur_status.as_str(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        if let Some(v) = self
            .sessions
            .get_session_stats()
            .get("energy_delivered_kwh")
            .and_then(|v| v.as_f64())
        {
            status_obj["energy_forward_kwh"] = serde_json::json!(v);
        }
        let _ = self.status_tx.send(status_obj.to_string());

        self.logger.debug("Poll cycle completed");
        let snapshot = std::sync::Arc::new(self.build_typed_snapshot(Some(self.last_poll_duration_ms())));
        let _ = self.status_snapshot_tx.send(snapshot);
        Ok(())
    }

    /// Read the setpoint back after a write and compare against what was
    /// intended, within `current_tolerance`. Returns `BridgeError::Verification`
    /// on mismatch rather than silently trusting the write succeeded.
    async fn verify_applied_current(&mut self, written: f32) -> Result<()> {
        let delay_ms = self.config.controls.verify_delay_ms as u64;
        if delay_ms == 0 {
            return Ok(());
        }
        tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;

        let socket_id = self.config.modbus.socket_slave_id;
        let addr_amps = self.config.registers.amps_config;
        let manager = match self.modbus_manager.as_mut() {
            Some(m) => m,
            None => return Ok(()),
        };
        let regs = manager.read_holding_registers(socket_id, addr_amps, 2).await?;
        let read_back = crate::modbus::decode_32bit_float(&regs).unwrap_or(f32::NAN);
        if (read_back - written).abs() > self.config.controls.current_tolerance {
            return Err(crate::error::BridgeError::verification(
                addr_amps,
                written,
                read_back,
            ));
        }
        Ok(())
    }
}
