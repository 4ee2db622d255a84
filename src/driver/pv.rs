impl super::ChargerEngine {
    pub(crate) async fn calculate_excess_pv_power(&self, ev_power_w: f64) -> Option<f32> {
        let dbus_guard = self.dbus.as_ref()?.lock().await;
        async fn get_f64(svc: &crate::dbus::DbusService, path: &str) -> f64 {
            match svc
                .read_remote_value("com.victronenergy.system", path)
                .await
            {
                Ok(v) => v
                    .as_f64()
                    .or_else(|| v.as_i64().map(|x| x as f64))
                    .or_else(|| v.as_u64().map(|x| x as f64))
                    .unwrap_or(0.0),
                Err(_) => 0.0,
            }
        }
        let dc_pv = get_f64(&dbus_guard, "/Dc/Pv/Power").await;
        let ac_pv_l1 = get_f64(&dbus_guard, "/Ac/PvOnOutput/L1/Power").await;
        let ac_pv_l2 = get_f64(&dbus_guard, "/Ac/PvOnOutput/L2/Power").await;
        let ac_pv_l3 = get_f64(&dbus_guard, "/Ac/PvOnOutput/L3/Power").await;
        let total_pv = dc_pv + ac_pv_l1 + ac_pv_l2 + ac_pv_l3;
        let cons_l1 = get_f64(&dbus_guard, "/Ac/Consumption/L1/Power").await;
        let cons_l2 = get_f64(&dbus_guard, "/Ac/Consumption/L2/Power").await;
        let cons_l3 = get_f64(&dbus_guard, "/Ac/Consumption/L3/Power").await;
        let consumption = cons_l1 + cons_l2 + cons_l3;
        // Venus OS convention: positive = battery charging, negative = battery discharging.
        // Discharging supplies extra power to the house, so it adds to excess PV;
        // charging consumes power, so it subtracts. battery_export_w is discharge-positive.
        let battery_power = get_f64(&dbus_guard, "/Dc/Battery/Power").await;
        let battery_export_w = -battery_power;
        let adjusted_consumption = (consumption - ev_power_w).max(0.0);
        let excess = (total_pv - adjusted_consumption + battery_export_w).max(0.0);
        Some(excess as f32)
    }

    /// Read the battery state of charge from the system service, as a
    /// percentage (0-100). `None` if D-Bus is unavailable or the path hasn't
    /// been published (no battery monitor on this installation).
    pub(crate) async fn read_battery_soc(&self) -> Option<f32> {
        let dbus_guard = self.dbus.as_ref()?.lock().await;
        let value = dbus_guard
            .read_remote_value("com.victronenergy.system", "/Dc/Battery/Soc")
            .await
            .ok()?;
        value
            .as_f64()
            .or_else(|| value.as_i64().map(|x| x as f64))
            .or_else(|| value.as_u64().map(|x| x as f64))
            .map(|x| x as f32)
    }
}
