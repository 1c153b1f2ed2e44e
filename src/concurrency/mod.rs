// 并发控制模块
//
// - AdmissionController：可动态调整容量的准入闸门
// - ConcurrencyManager：按操作类别管理准入控制器，响应配置变更

pub mod admission;
pub mod manager;

pub use admission::{AdmissionController, AdmissionPermit};
pub use manager::{ClassStats, ConcurrencyManager, ConcurrencyStats, OperationClass};
