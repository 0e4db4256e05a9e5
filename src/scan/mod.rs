//! Scan assembler, scan-class registry (G), and scan worker (H).

pub mod classes;
pub mod plan;
pub mod registry;
pub mod worker;

pub use classes::{GridScan, LineScan, ListScan, RoundScanFly};
pub use plan::{Action, Instruction, InstructionMetadata, PlanStream, ScanClass, ScanReportHint};
pub use registry::ScanClassRegistry;
pub use worker::{Scan, ScanWorker};
