use flash_nv::error::Error;
use flash_nv::{ByteStatistics, ItemInit, Nv, PageStatistics};
use pretty_assertions::assert_eq;
use std::cell::Cell;
use std::rc::Rc;

mod common;
use common::{Flash, LOG_SIZE, PAGE_SIZE};

const OLD: &[u8; 10] = b"0123456789";
const NEW: &[u8; 10] = b"9876543210";

fn bytes(live: u32, lost: u32, free: u32) -> ByteStatistics {
    ByteStatistics { live, lost, free }
}

fn settled() -> PageStatistics {
    PageStatistics {
        reserve: 1,
        in_use: 1,
        compacting: 0,
        target: 0,
        corrupted: 0,
    }
}

/// Flash operations a start on consistent flash takes. Such a start only reads.
fn boot_operations(flash: &Flash) -> usize {
    let mut scratch = flash.clone();
    scratch.operations.clear();
    Nv::new(0, scratch.len(), &mut scratch).unwrap();
    assert_eq!(scratch.mutations(), 0);
    scratch.operations.len()
}

/// Runs `op` with a power loss injected at every single flash operation in turn, then restarts
/// on the resulting flash content and hands it to `check`.
fn crash_at_every_operation(
    base: &Flash,
    tear: bool,
    op: impl Fn(&mut Nv<&mut Flash>) -> Result<(), Error>,
    check: impl Fn(&mut Flash),
) {
    let boot = boot_operations(base);

    for fault in 0.. {
        assert!(fault < 5000, "operation never completed");

        let mut flash = base.clone();
        flash.operations.clear();
        flash.fail_after_operation = boot + fault;
        flash.tear_on_fault = tear;

        let result = {
            let mut nv = Nv::new(0, flash.len(), &mut flash).unwrap();
            op(&mut nv)
        };

        println!("fault after operation #{fault}: {result:?}");
        flash.disable_faults();
        check(&mut flash);

        if result.is_ok() {
            break;
        }
    }
}

fn single_item() -> Flash {
    let mut flash = Flash::new(2);
    {
        let mut nv = Nv::new(0, flash.len(), &mut flash).unwrap();
        nv.item_init(5, 10, Some(OLD.as_slice())).unwrap();
    }
    flash
}

fn check_single_item(flash: &mut Flash) {
    {
        let mut nv = Nv::new(0, flash.len(), &mut *flash).unwrap();
        let mut buf = [0u8; 10];
        nv.read(5, 0, &mut buf).unwrap();
        assert!(&buf == OLD || &buf == NEW, "mixed content {buf:?}");
        assert_eq!(nv.statistics().pages, settled());
    }

    assert_eq!(flash.live_records(5).len(), 1);

    // and the item can still be updated
    let mut nv = Nv::new(0, flash.len(), &mut *flash).unwrap();
    nv.write(5, 0, b"abcdefghij").unwrap();
    let mut buf = [0u8; 10];
    nv.read(5, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"abcdefghij");
}

#[test]
fn update_survives_power_loss() {
    crash_at_every_operation(
        &single_item(),
        false,
        |nv| nv.write(5, 0, NEW),
        check_single_item,
    );
}

#[test]
fn update_survives_torn_writes() {
    crash_at_every_operation(
        &single_item(),
        true,
        |nv| nv.write(5, 0, NEW),
        check_single_item,
    );
}

fn two_big_items() -> Flash {
    let mut flash = Flash::new(2);
    {
        let mut nv = Nv::new(0, flash.len(), &mut flash).unwrap();
        nv.item_init(5, 1000, Some([b'a'; 1000].as_slice())).unwrap();
        nv.item_init(6, 1000, Some([b'b'; 1000].as_slice())).unwrap();
    }
    flash
}

fn check_two_big_items(flash: &mut Flash) {
    {
        let mut nv = Nv::new(0, flash.len(), &mut *flash).unwrap();
        let mut buf = [0u8; 1000];
        nv.read(5, 0, &mut buf).unwrap();
        assert!(buf == [b'a'; 1000] || buf == [b'c'; 1000]);
        nv.read(6, 0, &mut buf).unwrap();
        assert_eq!(buf, [b'b'; 1000]);
        assert_eq!(nv.statistics().pages, settled());
    }

    assert_eq!(flash.live_records(5).len(), 1);
    assert_eq!(flash.live_records(6).len(), 1);

    // the reserve is completely erased
    let reserve = (0..2)
        .find(|&page| flash.page_header(page)[0] == 0xFFFF)
        .unwrap();
    assert!(flash.is_page_erased(reserve));

    let mut nv = Nv::new(0, flash.len(), &mut *flash).unwrap();
    nv.write(6, 0, &[b'd'; 1000]).unwrap();
    let mut buf = [0u8; 1000];
    nv.read(6, 0, &mut buf).unwrap();
    assert_eq!(buf, [b'd'; 1000]);
}

#[test]
fn compaction_survives_power_loss() {
    crash_at_every_operation(
        &two_big_items(),
        false,
        |nv| nv.write(5, 0, &[b'c'; 1000]),
        check_two_big_items,
    );
}

#[test]
fn compaction_survives_torn_writes_and_erases() {
    crash_at_every_operation(
        &two_big_items(),
        true,
        |nv| nv.write(5, 0, &[b'c'; 1000]),
        check_two_big_items,
    );
}

#[test]
fn item_init_survives_power_loss() {
    let mut base = two_big_items();
    {
        let mut nv = Nv::new(0, base.len(), &mut base).unwrap();
        nv.delete(5, 1000).unwrap();
    }

    crash_at_every_operation(
        &base,
        false,
        |nv| nv.item_init(7, 1000, Some([b'c'; 1000].as_slice())).map(|_| ()),
        |flash| {
            let mut nv = Nv::new(0, flash.len(), &mut *flash).unwrap();
            let mut buf = [0u8; 1000];
            match nv.item_len(7).unwrap() {
                0 => {}
                1000 => {
                    nv.read(7, 0, &mut buf).unwrap();
                    assert_eq!(buf, [b'c'; 1000]);
                }
                len => panic!("unexpected length {len}"),
            }
            nv.read(6, 0, &mut buf).unwrap();
            assert_eq!(buf, [b'b'; 1000]);
            assert_eq!(nv.item_len(5).unwrap(), 0);
            assert_eq!(nv.statistics().pages, settled());

            // a retry either creates the item or finds it
            assert!(nv.item_init(7, 1000, Some([b'c'; 1000].as_slice())).is_ok());
            drop(nv);

            assert_eq!(flash.live_records(6).len(), 1);
            assert_eq!(flash.live_records(7).len(), 1);
        },
    );
}

#[test]
fn low_voltage_aborts_without_damage() {
    let mut flash = single_item();
    flash.brownout_after_operation = boot_operations(&flash);

    {
        let mut nv = Nv::new(0, flash.len(), &mut flash).unwrap();
        assert_eq!(nv.write(5, 0, NEW), Err(Error::LowVoltage));
        assert_eq!(
            nv.item_init(9, 4, Some([1, 2, 3, 4].as_slice())),
            Err(Error::LowVoltage)
        );

        let mut buf = [0u8; 10];
        nv.read(5, 0, &mut buf).unwrap();
        assert_eq!(&buf, OLD);
        assert_eq!(nv.item_len(9).unwrap(), 0);
    }
    assert_eq!(flash.mutations(), 0);

    flash.disable_faults();
    let mut nv = Nv::new(0, flash.len(), &mut flash).unwrap();
    nv.write(5, 0, NEW).unwrap();
    assert_eq!(
        nv.item_init(9, 4, Some([1, 2, 3, 4].as_slice())).unwrap(),
        ItemInit::Created
    );
}

#[test]
fn low_voltage_during_first_start() {
    let mut flash = Flash::new(2);
    flash.brownout_after_operation = 0;

    {
        let mut nv = Nv::new(0, flash.len(), &mut flash).unwrap();
        assert_eq!(nv.statistics().pages.reserve, 2);
        assert_eq!(
            nv.item_init(5, 4, Some([1, 2, 3, 4].as_slice())),
            Err(Error::FlashFull)
        );
    }
    assert_eq!(flash.mutations(), 0);

    flash.disable_faults();
    let mut nv = Nv::new(0, flash.len(), &mut flash).unwrap();
    assert_eq!(nv.statistics().pages, settled());
    assert_eq!(
        nv.item_init(5, 4, Some([1, 2, 3, 4].as_slice())).unwrap(),
        ItemInit::Created
    );
}

#[test]
fn corrupt_record_is_dropped() {
    let mut flash = single_item();
    {
        let mut nv = Nv::new(0, flash.len(), &mut flash).unwrap();
        nv.item_init(6, 10, Some(b"abcdefghij".as_slice())).unwrap();
    }

    // first payload byte of item 5
    flash.buf[PAGE_SIZE + 16] = 0x00;

    {
        let mut nv = Nv::new(0, flash.len(), &mut flash).unwrap();
        assert_eq!(nv.item_len(5).unwrap(), 0);
        assert_eq!(nv.read(5, 0, &mut [0u8; 10]), Err(Error::ItemNotFound));

        let mut buf = [0u8; 10];
        nv.read(6, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"abcdefghij");

        assert_eq!(
            nv.statistics().bytes_per_page,
            vec![bytes(0, 0, LOG_SIZE), bytes(20, 20, LOG_SIZE - 40)]
        );
    }

    let records = flash.records();
    assert_eq!(records[0].id, 0x0000);
    assert_eq!(records[1].id, 6);
}

#[test]
fn overrunning_record_closes_the_page() {
    let mut flash = single_item();

    // a header whose length runs past the end of the page
    let at = PAGE_SIZE + 28;
    flash.buf[at..at + 4].copy_from_slice(&[0x07, 0x00, 0xFF, 0xFF]);

    let mut nv = Nv::new(0, flash.len(), &mut flash).unwrap();
    assert_eq!(
        nv.statistics().bytes_per_page,
        vec![bytes(0, 0, LOG_SIZE), bytes(20, LOG_SIZE - 20, 0)]
    );

    let mut buf = [0u8; 10];
    nv.read(5, 0, &mut buf).unwrap();
    assert_eq!(&buf, OLD);

    // no room left on that page, the update goes through compaction
    nv.write(5, 0, NEW).unwrap();
    nv.read(5, 0, &mut buf).unwrap();
    assert_eq!(&buf, NEW);
    assert_eq!(
        nv.statistics().bytes_per_page,
        vec![bytes(20, 0, LOG_SIZE - 20), bytes(0, 0, LOG_SIZE)]
    );
}

#[test]
fn dirty_reserve_is_erased_again() {
    let mut flash = single_item();
    flash.buf[100] = 0x12;
    flash.operations.clear();

    {
        let nv = Nv::new(0, flash.len(), &mut flash).unwrap();
        assert_eq!(nv.statistics().pages, settled());
    }

    assert_eq!(flash.erases(), 1);
    assert_eq!(flash.erased_pages().into_iter().collect::<Vec<_>>(), vec![0]);
    assert!(flash.is_page_erased(0));
}

#[test]
fn interrupted_update_keeps_the_old_copy() {
    let mut flash = single_item();
    let record = PAGE_SIZE + 8;

    // old copy flagged, new copy appended but never committed
    flash.buf[record + 6..record + 8].copy_from_slice(&[0x00, 0x00]);
    flash.buf[record + 20..record + 24].copy_from_slice(&[0x05, 0x00, 0x0A, 0x00]);
    flash.buf[record + 28..record + 38].copy_from_slice(NEW);

    {
        let mut nv = Nv::new(0, flash.len(), &mut flash).unwrap();
        let mut buf = [0u8; 10];
        nv.read(5, 0, &mut buf).unwrap();
        assert_eq!(&buf, OLD);
    }

    let records = flash.records();
    assert_eq!(records.len(), 2);
    assert!(records[0].superseded && records[0].valid);
    // the uncommitted copy got tombstoned
    assert_eq!(records[1].id, 0x0000);
}

#[test]
fn committed_update_drops_the_old_copy() {
    let mut flash = single_item();
    let record = PAGE_SIZE + 8;

    // both copies valid, only the tombstone of the old one is missing
    let chk = common::checksum(NEW).to_le_bytes();
    flash.buf[record + 6..record + 8].copy_from_slice(&[0x00, 0x00]);
    flash.buf[record + 20..record + 24].copy_from_slice(&[0x05, 0x00, 0x0A, 0x00]);
    flash.buf[record + 24..record + 26].copy_from_slice(&chk);
    flash.buf[record + 28..record + 38].copy_from_slice(NEW);

    {
        let mut nv = Nv::new(0, flash.len(), &mut flash).unwrap();
        let mut buf = [0u8; 10];
        nv.read(5, 0, &mut buf).unwrap();
        assert_eq!(&buf, NEW);
    }

    let live = flash.live_records(5);
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].offset, 28);
    assert!(!live[0].superseded);
}

#[test]
fn init_is_idempotent() {
    let mut flash = single_item();
    let mut nv = Nv::new(0, flash.len(), &mut flash).unwrap();
    let before = nv.statistics();

    nv.init().unwrap();
    nv.init().unwrap();
    assert_eq!(nv.statistics(), before);

    let mut buf = [0u8; 10];
    nv.read(5, 0, &mut buf).unwrap();
    assert_eq!(&buf, OLD);
}

#[test]
fn faulting_flash_reports_errors() {
    let base = single_item();
    let boot = boot_operations(&base);
    let mut flash = Flash::new_with_fault(2, 0);
    flash.buf = base.buf.clone();
    flash.fail_after_operation = boot;

    let mut nv = Nv::new(0, flash.len(), &mut flash).unwrap();
    assert_eq!(nv.write(5, 0, NEW), Err(Error::FlashError));
    assert_eq!(nv.read(5, 0, &mut [0u8; 10]), Err(Error::FlashError));
    assert_eq!(nv.init(), Err(Error::FlashError));
}

/// Browns out after every single operation of a compacting update in turn, then brings the supply
/// back and runs `then` on the same engine instance before restarting.
fn brown_out_during_compaction(
    then: impl Fn(&mut Nv<&mut Flash>),
    check: impl Fn(&mut Nv<&mut Flash>),
) {
    let base = two_big_items();
    let boot = boot_operations(&base);

    for fault in 0.. {
        assert!(fault < 5000, "operation never completed");

        let mut flash = base.clone();
        flash.operations.clear();
        flash.brownout_after_operation = boot + fault;
        let restored = Rc::new(Cell::new(false));
        flash.supply_restored = restored.clone();

        let first = {
            let mut nv = Nv::new(0, flash.len(), &mut flash).unwrap();
            let first = nv.write(5, 0, &[b'c'; 1000]);
            println!("brown-out after operation #{fault}: {first:?}");

            restored.set(true);
            then(&mut nv);
            assert_eq!(nv.statistics().pages, settled());
            first
        };

        flash.disable_faults();
        let mut nv = Nv::new(0, flash.len(), &mut flash).unwrap();
        assert_eq!(nv.statistics().pages, settled());
        check(&mut nv);

        if first.is_ok() {
            break;
        }
    }
}

#[test]
fn update_after_brown_out_in_compaction_is_kept() {
    brown_out_during_compaction(
        |nv| nv.write(5, 0, &[b'd'; 1000]).unwrap(),
        |nv| {
            let mut buf = [0u8; 1000];
            nv.read(5, 0, &mut buf).unwrap();
            assert_eq!(buf, [b'd'; 1000]);
            nv.read(6, 0, &mut buf).unwrap();
            assert_eq!(buf, [b'b'; 1000]);
        },
    );
}

#[test]
fn delete_after_brown_out_in_compaction_is_kept() {
    brown_out_during_compaction(
        |nv| nv.delete(6, 1000).unwrap(),
        |nv| {
            assert_eq!(nv.item_len(6).unwrap(), 0);
            let mut buf = [0u8; 1000];
            nv.read(5, 0, &mut buf).unwrap();
            assert!(buf == [b'a'; 1000] || buf == [b'c'; 1000]);
        },
    );
}
