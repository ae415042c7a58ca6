use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use proptest::test_runner::TestCaseResult;

use blkrelay_backing::{completion_channel, Completion, IoStatus, MemBacking, SECTOR_SIZE};

use crate::device::RelayDevice;
use crate::registry::DeviceTable;
use crate::request::{IoRequest, SubmitLimits};
use crate::split::{split_for_limits, SplitPlan};

#[derive(Debug, Clone)]
enum Op {
    Write { sector: u64, data: Vec<u8> },
    Read { sector: u64, sectors: u32 },
    Flush,
}

const MAX_DEVICE_SECTORS: u64 = 64;
const MAX_OPS: usize = 24;
const MAX_TRANSFER_SECTORS: u32 = 8;

const WAIT: Duration = Duration::from_secs(5);

fn write_strategy(capacity: u64) -> BoxedStrategy<Op> {
    (0..capacity)
        .prop_flat_map(move |sector| {
            let max_sectors = (capacity - sector).min(MAX_TRANSFER_SECTORS as u64) as usize;
            (
                Just(sector),
                (1..=max_sectors).prop_flat_map(|sectors| {
                    prop::collection::vec(any::<u8>(), sectors * SECTOR_SIZE)
                }),
            )
        })
        .prop_map(|(sector, data)| Op::Write { sector, data })
        .boxed()
}

fn read_strategy(capacity: u64) -> BoxedStrategy<Op> {
    // Reads may run past the end; those must fail without disturbing state.
    (0..capacity + 4, 0u32..=MAX_TRANSFER_SECTORS + 2)
        .prop_map(|(sector, sectors)| Op::Read { sector, sectors })
        .boxed()
}

fn op_strategy(capacity: u64) -> BoxedStrategy<Op> {
    prop_oneof![
        4 => write_strategy(capacity),
        4 => read_strategy(capacity),
        1 => Just(Op::Flush),
    ]
    .boxed()
}

fn scenario_strategy() -> BoxedStrategy<(u64, u32, Vec<Op>)> {
    (1..=MAX_DEVICE_SECTORS)
        .prop_flat_map(|capacity| {
            (
                Just(capacity),
                prop_oneof![Just(0u32), Just(1), Just(3), Just(4), Just(7)],
                prop::collection::vec(op_strategy(capacity), 1..=MAX_OPS),
            )
        })
        .boxed()
}

/// Drive a relay over an in-memory store and mirror every operation against a
/// plain byte-vector model. Whatever the split limit, the relay must behave
/// exactly like the store itself.
fn run_ops(capacity: u64, limit: u32, ops: &[Op]) -> TestCaseResult {
    let table = Arc::new(DeviceTable::new());
    let backing = MemBacking::new(capacity);
    let device = RelayDevice::create_with_backing(
        "prop".to_owned(),
        Box::new(backing.clone()),
        SubmitLimits::with_max_sectors(limit),
        table.clone(),
    )
    .unwrap();

    let mut model = vec![0u8; (capacity as usize) * SECTOR_SIZE];

    for op in ops {
        match op {
            Op::Write { sector, data } => {
                let (done, waiter) = completion_channel();
                device.submit(IoRequest::write(*sector, data.clone(), done));
                let result = waiter.wait_timeout(WAIT).expect("write completion");
                prop_assert_eq!(result.status, IoStatus::Ok);

                let start = (*sector as usize) * SECTOR_SIZE;
                model[start..start + data.len()].copy_from_slice(data);
            }
            Op::Read { sector, sectors } => {
                let (done, waiter) = completion_channel();
                device.submit(IoRequest::read(*sector, *sectors, done));
                let result = waiter.wait_timeout(WAIT).expect("read completion");

                if *sectors == 0 {
                    // Zero-length transfers complete successfully everywhere.
                    prop_assert_eq!(result.status, IoStatus::Ok);
                    prop_assert!(result.data.is_none());
                } else if sector + *sectors as u64 <= capacity {
                    prop_assert_eq!(result.status, IoStatus::Ok);
                    let start = (*sector as usize) * SECTOR_SIZE;
                    let len = (*sectors as usize) * SECTOR_SIZE;
                    prop_assert_eq!(result.data.as_deref(), Some(&model[start..start + len]));
                } else {
                    prop_assert_eq!(result.status, IoStatus::IoError);
                }
            }
            Op::Flush => {
                let (done, waiter) = completion_channel();
                device.submit(IoRequest::flush(done));
                let result = waiter.wait_timeout(WAIT).expect("flush completion");
                prop_assert_eq!(result.status, IoStatus::Ok);
            }
        }
    }

    // One full-device read exercises reassembly across the whole range.
    let (done, waiter) = completion_channel();
    device.submit(IoRequest::read(0, capacity as u32, done));
    let result = waiter.wait_timeout(WAIT).expect("final read completion");
    prop_assert_eq!(result.status, IoStatus::Ok);
    prop_assert_eq!(result.data.as_deref(), Some(model.as_slice()));

    // And the store itself holds exactly the model bytes.
    prop_assert_eq!(&backing.contents(), &model);

    device.delete();
    prop_assert!(table.is_empty());
    prop_assert_eq!(device.in_flight(), 0);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_relay_is_transparent_for_any_split_limit(
        (capacity, limit, ops) in scenario_strategy()
    ) {
        run_ops(capacity, limit, &ops)?;
    }

    #[test]
    fn prop_split_parts_tile_reads_exactly(
        (sector, sectors, max) in (0u64..(1u64 << 40), 1u32..=1024, 1u32..=64)
    ) {
        let completion = Completion::from_fn(|_| {});
        let plan = split_for_limits(
            IoRequest::read(sector, sectors, completion),
            SubmitLimits::with_max_sectors(max),
        );
        match plan {
            SplitPlan::Whole(req) => {
                prop_assert!(sectors <= max);
                prop_assert_eq!(req.sector, sector);
                prop_assert_eq!(req.sectors(), sectors as u64);
            }
            SplitPlan::Parts(parts) => {
                prop_assert!(sectors > max);
                let mut next = sector;
                let mut total = 0u64;
                for part in &parts {
                    prop_assert_eq!(part.sector, next);
                    prop_assert!(part.sectors() > 0);
                    prop_assert!(part.sectors() <= max as u64);
                    next += part.sectors();
                    total += part.sectors();
                }
                prop_assert_eq!(total, sectors as u64);
            }
            _ => prop_assert!(false, "unexpected plan for a non-empty read"),
        }
    }
}
