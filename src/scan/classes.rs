//! Concrete scan classes (component G), grounded on
//! `original_source/scan_server/scan_server/scan_assembler.py` (one class
//! per scan type, resolved by name out of a registry) and on the
//! instruction sequences asserted throughout
//! `original_source/scan_server/tests/test_scans.py` (step-scan fixtures
//! around `test_scans.py:440` ff., fly-scan fixture around
//! `test_scans.py:2280` ff.).
//!
//! Every class shares the outer envelope from spec §4.3:
//! `open_scan -> stage -> baseline_reading -> pre_scan -> <body> ->
//! unstage -> close_scan`. Step-shaped classes ([`GridScan`], [`LineScan`],
//! [`ListScan`]) fill `<body>` with one
//! `set -> wait(move) -> trigger -> wait(trigger) -> read -> wait(read)`
//! per point; [`RoundScanFly`] fills it with a single
//! `kickoff -> wait(move) -> complete -> read -> wait(read)`.

use futures::stream;
use serde_json::{json, Value};
use uuid::Uuid;

use super::plan::{
    bundle_args, Action, DeviceTarget, Instruction, InstructionMetadata, PlanStream, ScanClass,
    ScanReportHint, WaitKind,
};
use crate::error::GuardError;

const SCAN_MOTOR_GROUP: &str = "scan_motor";
const TRIGGER_GROUP: &str = "trigger";
const READOUT_GROUP: &str = "readout_primary";
const KICKOFF_GROUP: &str = "kickoff";

fn metadata(rid: Uuid, scan_id: Uuid) -> InstructionMetadata {
    InstructionMetadata {
        rid,
        scan_id: Some(scan_id),
        ..Default::default()
    }
}

fn with_point(mut meta: InstructionMetadata, point_id: u64) -> InstructionMetadata {
    meta.point_id = Some(point_id);
    meta
}

/// Evenly spaced positions from `start` to `stop`, `count` of them
/// (`count` == 1 collapses to `start`, matching a single-point request).
fn linspace(start: f64, stop: f64, count: u64) -> Vec<f64> {
    if count <= 1 {
        return vec![start];
    }
    let step = (stop - start) / (count - 1) as f64;
    (0..count).map(|i| start + step * i as f64).collect()
}

fn as_f64(value: &Value, scan_type: &str, what: &str) -> Result<f64, GuardError> {
    value.as_f64().ok_or_else(|| GuardError::InvalidArgs {
        scan_type: scan_type.to_string(),
        reason: format!("{what} must be numeric, got {value}"),
    })
}

/// Wraps `body` in the shared `open_scan -> stage -> baseline_reading ->
/// pre_scan -> body -> unstage -> close_scan` envelope (spec §4.3).
fn wrap_scan_body(rid: Uuid, open_params: Value, body: Vec<Instruction>) -> Vec<Instruction> {
    let scan_id = rid;
    let mut out = vec![
        Instruction::new(DeviceTarget::None, Action::OpenScan, open_params)
            .with_metadata(metadata(rid, scan_id)),
        Instruction::new(DeviceTarget::None, Action::Stage, json!({}))
            .with_metadata(metadata(rid, scan_id)),
        Instruction::new(DeviceTarget::None, Action::BaselineReading, json!({}))
            .with_metadata(metadata(rid, scan_id)),
        Instruction::new(DeviceTarget::None, Action::PreScan, json!({}))
            .with_metadata(metadata(rid, scan_id)),
    ];
    out.extend(body);
    out.push(
        Instruction::new(DeviceTarget::None, Action::Unstage, json!({}))
            .with_metadata(metadata(rid, scan_id)),
    );
    out.push(
        Instruction::new(DeviceTarget::None, Action::CloseScan, json!({}))
            .with_metadata(metadata(rid, scan_id)),
    );
    out
}

/// One `set -> wait(move) -> trigger -> wait(trigger) -> read ->
/// wait(read)` point, synchronizing every axis in `moves` before
/// triggering (spec §4.3, grounded on the `scan_motor`/`trigger`/
/// `readout_primary` wait-group tags in `test_scans.py`).
fn step_point(rid: Uuid, scan_id: Uuid, point_id: u64, moves: &[(String, f64)]) -> Vec<Instruction> {
    let mut out = Vec::new();
    for (device, value) in moves {
        out.push(
            Instruction::new(DeviceTarget::One(device.clone()), Action::Set, json!({"value": value}))
                .with_metadata(metadata(rid, scan_id))
                .with_wait_group(SCAN_MOTOR_GROUP),
        );
    }
    out.push(Instruction::wait(WaitKind::Move, SCAN_MOTOR_GROUP, metadata(rid, scan_id)));
    out.push(
        Instruction::new(DeviceTarget::None, Action::Trigger, json!({}))
            .with_metadata(with_point(metadata(rid, scan_id), point_id))
            .with_wait_group(TRIGGER_GROUP),
    );
    out.push(Instruction::wait(WaitKind::Trigger, TRIGGER_GROUP, metadata(rid, scan_id)));
    out.push(
        Instruction::new(DeviceTarget::None, Action::Read, json!({}))
            .with_metadata(with_point(metadata(rid, scan_id), point_id))
            .with_wait_group(READOUT_GROUP),
    );
    out.push(Instruction::wait(WaitKind::Read, READOUT_GROUP, metadata(rid, scan_id)));
    out
}

fn to_plan_stream(instructions: Vec<Instruction>) -> PlanStream<'static> {
    let items: Vec<Result<Instruction, GuardError>> = instructions.into_iter().map(Ok).collect();
    Box::pin(stream::iter(items))
}

/// `grid_scan(dev1, start1, stop1, n1, dev2, start2, stop2, n2, ...)`: a
/// synchronous cartesian-product grid over every axis (spec §8 S1).
pub struct GridScan;

impl ScanClass for GridScan {
    fn name(&self) -> &str {
        "grid_scan"
    }
    fn arg_bundle_size(&self) -> usize {
        4
    }
    fn scan_report_hint(&self) -> ScanReportHint {
        ScanReportHint::Table { devices: vec![] }
    }
    fn doc(&self) -> &str {
        "grid_scan(device, start, stop, num_points, ...): cartesian-product grid over every axis"
    }

    fn run(
        &self,
        rid: Uuid,
        args: &[Value],
        _kwargs: &serde_json::Map<String, Value>,
    ) -> Result<PlanStream<'static>, GuardError> {
        let bundles = bundle_args(args, self.arg_bundle_size())?;
        let mut axes = Vec::with_capacity(bundles.len());
        for bundle in &bundles {
            let start = as_f64(&bundle.params[0], self.name(), "start")?;
            let stop = as_f64(&bundle.params[1], self.name(), "stop")?;
            let num_points = bundle.params[2].as_u64().ok_or_else(|| GuardError::InvalidArgs {
                scan_type: self.name().to_string(),
                reason: "num_points must be an unsigned integer".into(),
            })?;
            axes.push((bundle.device.clone(), linspace(start, stop, num_points)));
        }

        let scan_id = rid;
        let total_points: u64 = axes.iter().map(|(_, values)| values.len() as u64).product();
        let scan_motors: Vec<String> = axes.iter().map(|(dev, _)| dev.clone()).collect();
        let open_params = json!({
            "scan_motors": scan_motors,
            "num_points": total_points,
            "scan_name": self.name(),
            "scan_type": "step",
        });

        let mut body = Vec::new();
        let mut point_id = 0u64;
        for combo in cartesian_product(&axes) {
            body.extend(step_point(rid, scan_id, point_id, &combo));
            point_id += 1;
        }

        Ok(to_plan_stream(wrap_scan_body(rid, open_params, body)))
    }
}

/// Enumerate every combination across `axes`, one `(device, value)` pair
/// per axis, in row-major order (last axis varies fastest).
fn cartesian_product(axes: &[(String, Vec<f64>)]) -> Vec<Vec<(String, f64)>> {
    let mut combos: Vec<Vec<(String, f64)>> = vec![Vec::new()];
    for (device, values) in axes {
        let mut next = Vec::with_capacity(combos.len() * values.len());
        for combo in &combos {
            for value in values {
                let mut extended = combo.clone();
                extended.push((device.clone(), *value));
                next.push(extended);
            }
        }
        combos = next;
    }
    combos
}

/// `line_scan(dev1, start1, stop1, dev2, start2, stop2, ..., steps=N)`:
/// every axis moves together through `steps` synchronized positions
/// (spec §8 S3).
pub struct LineScan;

impl ScanClass for LineScan {
    fn name(&self) -> &str {
        "line_scan"
    }
    fn arg_bundle_size(&self) -> usize {
        3
    }
    fn required_kwargs(&self) -> &[&str] {
        &["steps"]
    }
    fn scan_report_hint(&self) -> ScanReportHint {
        ScanReportHint::Table { devices: vec![] }
    }
    fn doc(&self) -> &str {
        "line_scan(device, start, stop, ..., steps=N): synchronized line over every axis"
    }

    fn run(
        &self,
        rid: Uuid,
        args: &[Value],
        kwargs: &serde_json::Map<String, Value>,
    ) -> Result<PlanStream<'static>, GuardError> {
        let bundles = bundle_args(args, self.arg_bundle_size())?;
        let steps = kwargs
            .get("steps")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| GuardError::InvalidArgs {
                scan_type: self.name().to_string(),
                reason: "missing required kwarg 'steps'".into(),
            })?;

        let mut axes = Vec::with_capacity(bundles.len());
        for bundle in &bundles {
            let start = as_f64(&bundle.params[0], self.name(), "start")?;
            let stop = as_f64(&bundle.params[1], self.name(), "stop")?;
            axes.push((bundle.device.clone(), linspace(start, stop, steps)));
        }

        let scan_id = rid;
        let scan_motors: Vec<String> = axes.iter().map(|(dev, _)| dev.clone()).collect();
        let open_params = json!({
            "scan_motors": scan_motors,
            "num_points": steps,
            "scan_name": self.name(),
            "scan_type": "step",
        });

        let mut body = Vec::new();
        for point_id in 0..steps {
            let moves: Vec<(String, f64)> = axes
                .iter()
                .map(|(dev, values)| (dev.clone(), values[point_id as usize]))
                .collect();
            body.extend(step_point(rid, scan_id, point_id, &moves));
        }

        Ok(to_plan_stream(wrap_scan_body(rid, open_params, body)))
    }
}

/// `list_scan(dev1, [p0, p1, ...], dev2, [q0, q1, ...], ...)`: every axis's
/// position list must share the same length (spec §8 S2).
pub struct ListScan;

impl ScanClass for ListScan {
    fn name(&self) -> &str {
        "list_scan"
    }
    fn arg_bundle_size(&self) -> usize {
        2
    }
    fn scan_report_hint(&self) -> ScanReportHint {
        ScanReportHint::Table { devices: vec![] }
    }
    fn doc(&self) -> &str {
        "list_scan(device, [positions], ...): explicit per-axis position lists, equal length required"
    }

    fn validate(&self, args: &[Value], kwargs: &serde_json::Map<String, Value>) -> Result<(), GuardError> {
        let bundles = bundle_args(args, self.arg_bundle_size())?;
        let lengths: Result<Vec<usize>, GuardError> = bundles
            .iter()
            .map(|bundle| {
                bundle.params[0]
                    .as_array()
                    .map(|a| a.len())
                    .ok_or_else(|| GuardError::InvalidArgs {
                        scan_type: self.name().to_string(),
                        reason: "each axis argument must be a position list".into(),
                    })
            })
            .collect();
        let lengths = lengths?;
        if let Some(first) = lengths.first() {
            if lengths.iter().any(|len| len != first) {
                return Err(GuardError::InvalidArgs {
                    scan_type: self.name().to_string(),
                    reason: format!("position lists have unequal lengths: {lengths:?}"),
                });
            }
        }
        for required in self.required_kwargs() {
            if !kwargs.contains_key(*required) {
                return Err(GuardError::InvalidArgs {
                    scan_type: self.name().to_string(),
                    reason: format!("missing required kwarg '{required}'"),
                });
            }
        }
        Ok(())
    }

    fn run(
        &self,
        rid: Uuid,
        args: &[Value],
        kwargs: &serde_json::Map<String, Value>,
    ) -> Result<PlanStream<'static>, GuardError> {
        self.validate(args, kwargs)?;
        let bundles = bundle_args(args, self.arg_bundle_size())?;
        let mut axes = Vec::with_capacity(bundles.len());
        for bundle in &bundles {
            let positions: Vec<f64> = bundle.params[0]
                .as_array()
                .into_iter()
                .flatten()
                .map(|v| as_f64(v, self.name(), "position"))
                .collect::<Result<_, _>>()?;
            axes.push((bundle.device.clone(), positions));
        }
        let num_points = axes.first().map(|(_, v)| v.len()).unwrap_or(0) as u64;

        let scan_id = rid;
        let scan_motors: Vec<String> = axes.iter().map(|(dev, _)| dev.clone()).collect();
        let open_params = json!({
            "scan_motors": scan_motors,
            "num_points": num_points,
            "scan_name": self.name(),
            "scan_type": "step",
        });

        let mut body = Vec::new();
        for point_id in 0..num_points {
            let moves: Vec<(String, f64)> = axes
                .iter()
                .map(|(dev, values)| (dev.clone(), values[point_id as usize]))
                .collect();
            body.extend(step_point(rid, scan_id, point_id, &moves));
        }

        Ok(to_plan_stream(wrap_scan_body(rid, open_params, body)))
    }
}

/// `round_scan_fly(flyer, inner_ring, outer_ring, num_rings, num_positions,
/// exp_time=...)`: a single continuous `kickoff -> wait(move) -> complete`
/// rather than a per-point set/trigger (spec §8 S5), grounded on the
/// `otf`/`round_scan_fly` fixture in `test_scans.py` around line 2280.
pub struct RoundScanFly;

impl ScanClass for RoundScanFly {
    fn name(&self) -> &str {
        "round_scan_fly"
    }
    fn arg_bundle_size(&self) -> usize {
        5
    }
    fn scan_report_hint(&self) -> ScanReportHint {
        ScanReportHint::ScanProgress { device: String::new() }
    }
    fn doc(&self) -> &str {
        "round_scan_fly(flyer, inner_ring, outer_ring, num_rings, num_positions, exp_time=...): continuous fly scan over concentric rings"
    }

    fn run(
        &self,
        rid: Uuid,
        args: &[Value],
        kwargs: &serde_json::Map<String, Value>,
    ) -> Result<PlanStream<'static>, GuardError> {
        let bundles = bundle_args(args, self.arg_bundle_size())?;
        let bundle = bundles.first().ok_or_else(|| GuardError::InvalidArgs {
            scan_type: self.name().to_string(),
            reason: "round_scan_fly takes exactly one flyer bundle".into(),
        })?;
        let flyer = bundle.device.clone();
        let inner_ring = as_f64(&bundle.params[0], self.name(), "inner_ring")?;
        let outer_ring = as_f64(&bundle.params[1], self.name(), "outer_ring")?;
        let num_rings = bundle.params[2].as_u64().ok_or_else(|| GuardError::InvalidArgs {
            scan_type: self.name().to_string(),
            reason: "num_rings must be an unsigned integer".into(),
        })?;
        let num_positions = bundle.params[3].as_u64().ok_or_else(|| GuardError::InvalidArgs {
            scan_type: self.name().to_string(),
            reason: "num_positions must be an unsigned integer".into(),
        })?;
        let exp_time = kwargs.get("exp_time").cloned().unwrap_or(json!(0));

        // Ring k (1-indexed) carries roughly k * num_positions points
        // around its circumference, the same "more positions on outer
        // rings" shape the original round-scan math produces.
        let total_points: u64 = (1..=num_rings).map(|k| k * num_positions).sum();

        let scan_id = rid;
        let open_params = json!({
            "scan_motors": [],
            "num_points": total_points,
            "scan_name": self.name(),
            "scan_type": "fly",
        });

        let body = vec![
            Instruction::new(
                DeviceTarget::One(flyer.clone()),
                Action::Kickoff,
                json!({
                    "configure": {
                        "inner_ring": inner_ring,
                        "outer_ring": outer_ring,
                        "num_rings": num_rings,
                        "num_positions": num_positions,
                        "exp_time": exp_time,
                    },
                    "wait_group": KICKOFF_GROUP,
                }),
            )
            .with_metadata(metadata(rid, scan_id))
            .with_wait_group(KICKOFF_GROUP),
            Instruction::wait(WaitKind::Move, KICKOFF_GROUP, metadata(rid, scan_id)),
            Instruction::new(DeviceTarget::One(flyer), Action::Complete, json!({}))
                .with_metadata(metadata(rid, scan_id)),
            Instruction::new(DeviceTarget::None, Action::Read, json!({"group": "primary"}))
                .with_metadata(with_point(metadata(rid, scan_id), total_points.saturating_sub(1)))
                .with_wait_group(READOUT_GROUP),
            Instruction::wait(WaitKind::Read, READOUT_GROUP, metadata(rid, scan_id)),
        ];

        Ok(to_plan_stream(wrap_scan_body(rid, open_params, body)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    async fn drain(stream: PlanStream<'static>) -> Vec<Instruction> {
        stream.map(|r| r.unwrap()).collect().await
    }

    #[tokio::test]
    async fn grid_scan_produces_the_cartesian_product_of_points() {
        let scan = GridScan;
        let args = vec![
            json!("samx"), json!(-5.0), json!(5.0), json!(10),
            json!("samy"), json!(-5.0), json!(5.0), json!(10),
        ];
        let instructions = drain(scan.run(Uuid::new_v4(), &args, &serde_json::Map::new()).unwrap()).await;
        let sets = instructions.iter().filter(|i| i.action == Action::Set).count();
        // 10 * 10 points, 2 sets each (one per axis).
        assert_eq!(sets, 200);
        assert!(matches!(instructions.first().unwrap().action, Action::OpenScan));
        assert!(matches!(instructions.last().unwrap().action, Action::CloseScan));
    }

    #[tokio::test]
    async fn line_scan_uses_the_steps_kwarg_for_point_count() {
        let scan = LineScan;
        let args = vec![json!("samx"), json!(-5.0), json!(5.0)];
        let mut kwargs = serde_json::Map::new();
        kwargs.insert("steps".into(), json!(200));
        let instructions = drain(scan.run(Uuid::new_v4(), &args, &kwargs).unwrap()).await;
        let reads = instructions.iter().filter(|i| i.action == Action::Read).count();
        assert_eq!(reads, 200);
    }

    #[test]
    fn list_scan_rejects_unequal_length_position_lists() {
        let scan = ListScan;
        let args = vec![
            json!("samx"), json!([0, 1, 2, 3, 4]),
            json!("samy"), json!([0, 1, 2, 3]),
        ];
        let err = scan.validate(&args, &serde_json::Map::new()).unwrap_err();
        assert!(matches!(err, GuardError::InvalidArgs { .. }));
    }

    #[tokio::test]
    async fn round_scan_fly_emits_kickoff_then_complete_once() {
        let scan = RoundScanFly;
        let args = vec![json!("flyer"), json!(0.0), json!(50.0), json!(20), json!(3)];
        let mut kwargs = serde_json::Map::new();
        kwargs.insert("exp_time".into(), json!(0.1));
        let instructions = drain(scan.run(Uuid::new_v4(), &args, &kwargs).unwrap()).await;
        assert_eq!(instructions.iter().filter(|i| i.action == Action::Kickoff).count(), 1);
        assert_eq!(instructions.iter().filter(|i| i.action == Action::Complete).count(), 1);
        assert!(matches!(instructions.first().unwrap().action, Action::OpenScan));
        assert!(matches!(instructions.last().unwrap().action, Action::CloseScan));
    }
}
