//! End-to-end tests of the DP master against the dummy slave PHY.

use profidp::dp::{DpMaster, MasterParameters, SlaveDescriptor, SlaveHandle};
use profidp::phy::DummySlavePhy;
use profidp::time::{Duration, Instant};

const TICK: Duration = Duration::from_millis(1);

fn prepare_logger() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}

fn new_master() -> DpMaster<DummySlavePhy> {
    DpMaster::new(
        DummySlavePhy::new(),
        MasterParameters {
            address: 2,
            ..Default::default()
        },
    )
    .unwrap()
}

fn new_slave_descriptor(input_size: usize, output_size: usize) -> SlaveDescriptor {
    let mut desc = SlaveDescriptor::new(8, 0x4224);
    desc.input_size = input_size;
    desc.output_size = output_size;
    desc.set_watchdog(300).unwrap();
    desc
}

/// Tick the master until `predicate` holds, at most `limit` ticks.
fn run_until<F>(
    master: &mut DpMaster<DummySlavePhy>,
    now: &mut Instant,
    tick: Duration,
    limit: usize,
    mut predicate: F,
) -> bool
where
    F: FnMut(&mut DpMaster<DummySlavePhy>) -> bool,
{
    for _ in 0..limit {
        let _ = master.run(*now);
        *now += tick;
        if predicate(master) {
            return true;
        }
    }
    false
}

fn connect(master: &mut DpMaster<DummySlavePhy>, now: &mut Instant, handle: SlaveHandle) {
    assert!(
        run_until(master, now, TICK, 25, |m| m.is_connected(handle)),
        "slave did not connect within 25 ticks"
    );
}

#[test]
fn init_to_data_exchange() {
    prepare_logger();
    let mut master = new_master();
    let handle = master.add_slave(new_slave_descriptor(1, 1)).unwrap();

    assert!(!master.is_connected(handle));
    assert!(!master.is_connecting(handle));

    let mut now = Instant::ZERO;
    connect(&mut master, &mut now, handle);
    assert!(!master.is_connecting(handle));
}

#[test]
fn data_exchange_inverts_bytes() {
    prepare_logger();
    let mut master = new_master();
    let handle = master.add_slave(new_slave_descriptor(1, 1)).unwrap();

    let mut now = Instant::ZERO;
    connect(&mut master, &mut now, handle);

    // The dummy slave inverts every data byte.
    for (out, expected_in) in [(0x5A, 0xA5), (0x00, 0xFF), (0xFF, 0x00)] {
        master.set_master_out_data(handle, vec![out]).unwrap();

        let mut received = None;
        let arrived = run_until(&mut master, &mut now, TICK, 20, |m| {
            received = m.take_master_in_data(handle);
            received.is_some()
        });
        assert!(arrived, "no DX reply for output 0x{out:02X}");
        assert_eq!(received.unwrap(), vec![expected_in]);
    }
}

#[test]
fn dx_size_mismatch_drops_data() {
    prepare_logger();
    let mut master = new_master();
    let handle = master.add_slave(new_slave_descriptor(1, 2)).unwrap();

    // The slave is configured for 2 bytes of input data, but the PHY
    // delivers 3 bytes.
    master.phy_driver_mut().set_echo_dx_size(Some(3));

    let mut now = Instant::ZERO;
    connect(&mut master, &mut now, handle);

    master.set_master_out_data(handle, vec![0x11]).unwrap();
    let arrived = run_until(&mut master, &mut now, TICK, 20, |m| {
        m.take_master_in_data(handle).is_some()
    });
    assert!(!arrived, "mismatching DX data must be dropped");
}

#[test]
fn transmit_faults_drive_reinitialization() {
    prepare_logger();
    let mut master = new_master();
    let handle = master.add_slave(new_slave_descriptor(1, 1)).unwrap();

    let mut now = Instant::ZERO;
    connect(&mut master, &mut now, handle);

    // Five consecutive transmit failures exceed the fault threshold and
    // force the slave back to Init...
    master.phy_driver_mut().inject_transmit_faults(5);
    master.set_master_out_data(handle, vec![0x5A]).unwrap();

    let tick = Duration::from_millis(10);
    assert!(
        run_until(&mut master, &mut now, tick, 200, |m| !m
            .is_connected(handle)),
        "slave did not fall back to Init"
    );

    // ...after which the full initialization sequence runs again and data
    // exchange resumes.
    assert!(
        run_until(&mut master, &mut now, tick, 200, |m| m.is_connected(handle)),
        "slave did not reconnect"
    );
    master.set_master_out_data(handle, vec![0x0F]).unwrap();
    let mut received = None;
    let arrived = run_until(&mut master, &mut now, tick, 50, |m| {
        received = m.take_master_in_data(handle);
        received.is_some()
    });
    assert!(arrived, "no DX reply after reconnection");
    assert_eq!(received.unwrap(), vec![0xF0]);
}

#[test]
fn input_only_slave_gets_short_confirmations() {
    prepare_logger();
    let mut master = new_master();
    // output_size = 0: the slave never sends data, only short ACKs.
    let handle = master.add_slave(new_slave_descriptor(1, 0)).unwrap();
    master.phy_driver_mut().set_echo_dx(false);

    let mut now = Instant::ZERO;
    connect(&mut master, &mut now, handle);

    master.set_master_out_data(handle, vec![0x77]).unwrap();
    // The exchange completes without ever producing in-data.
    assert!(!run_until(&mut master, &mut now, TICK, 20, |m| {
        m.take_master_in_data(handle).is_some()
    }));
    assert!(master.is_connected(handle));
}

#[test]
fn periodic_diagnosis_interleaves_with_data_exchange() {
    prepare_logger();
    let mut master = new_master();
    let mut desc = new_slave_descriptor(1, 1);
    // Request a diagnosis cycle after every DX cycle.
    desc.diag_period = 1;
    let handle = master.add_slave(desc).unwrap();

    let mut now = Instant::ZERO;
    connect(&mut master, &mut now, handle);

    // Data exchange keeps working across the interleaved diagnosis cycles.
    for out in [0x01u8, 0x02, 0x03] {
        master.set_master_out_data(handle, vec![out]).unwrap();
        let mut received = None;
        let arrived = run_until(&mut master, &mut now, TICK, 40, |m| {
            received = m.take_master_in_data(handle);
            received.is_some()
        });
        assert!(arrived, "no DX reply for output 0x{out:02X}");
        assert_eq!(received.unwrap(), vec![out ^ 0xFF]);
        assert!(master.is_connected(handle));
    }
}

#[test]
fn global_control_telegrams_are_sent() {
    prepare_logger();
    let mut master = new_master();
    let handle = master.add_slave(new_slave_descriptor(1, 1)).unwrap();

    let mut now = Instant::ZERO;
    connect(&mut master, &mut now, handle);

    // Global control is fire-and-forget (SDN to the multicast address);
    // the dummy slave swallows it without a reply.
    master.sync_mode(now, 0x01).unwrap();
    master.freeze_mode_cancel(now, 0x01).unwrap();

    // The master keeps running afterwards.
    master.set_master_out_data(handle, vec![0x33]).unwrap();
    let arrived = run_until(&mut master, &mut now, TICK, 40, |m| {
        m.take_master_in_data(handle).is_some()
    });
    assert!(arrived);
}
