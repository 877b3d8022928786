// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::crossbeam_channel::{
    self,
    Receiver,
    Sender,
};
use ::kds::{
    kds::{
        cu::{
            AP_DONE,
            AP_IDLE,
        },
        exec::LocalHandler,
        packet::{
            CommandType,
            ConfigFeatures,
            ConfigurePacket,
            PacketHeader,
            StartKernelPacket,
        },
        register::MemoryRegion,
    },
    runtime::{
        self,
        logging,
    },
    CommandState,
    Config,
    CuIndex,
    Device,
    ExecBuffer,
    ExecResources,
    Fail,
    Opcode,
    Scheduler,
    SharedClient,
    Tunables,
    XclbinId,
};
use ::std::{
    sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
        Mutex,
    },
    thread::{
        self,
        JoinHandle,
    },
    time::Duration,
};

//======================================================================================================================
// Constants
//======================================================================================================================

const CU_STRIDE: u32 = 0x1_0000;
const XCLBIN: u128 = 0x5eed_0000_0001;
const NUM_CUS: u32 = 4;
const WAIT: Duration = Duration::from_secs(5);

//======================================================================================================================
// Structures
//======================================================================================================================

/// Counts host-local commands.
#[derive(Default)]
struct CopyCounter {
    copies: AtomicUsize,
    last: Mutex<Vec<u32>>,
}

struct Card {
    scheduler: Scheduler,
    device: Device,
    bar: Arc<MemoryRegion>,
    copies: Arc<CopyCounter>,
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl LocalHandler for CopyCounter {
    fn execute(&self, packet: &[u32]) -> Result<(), Fail> {
        self.copies.fetch_add(1, Ordering::AcqRel);
        *runtime::lock(&self.last) = packet.to_vec();
        Ok(())
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Brings up a host-scheduled card whose CUs finish every start at once.
fn card(tunables: Tunables) -> Result<Card> {
    logging::initialize();
    let scheduler: Scheduler = Scheduler::new(tunables);
    let bar: Arc<MemoryRegion> = Arc::new(MemoryRegion::new(0x10_0000));
    let csr: Arc<MemoryRegion> = Arc::new(MemoryRegion::new(0x100));
    let cq: Arc<MemoryRegion> = Arc::new(MemoryRegion::new(0x1_0000));
    let copies: Arc<CopyCounter> = Arc::new(CopyCounter::default());
    let mut res: ExecResources = ExecResources::new(bar.clone(), csr, cq, 0x1_0000);
    res.ert_available = false;
    res.local_handler = Some(copies.clone());

    let device: Device = Device::new(&scheduler, res)?;
    device.load_xclbin(XclbinId::from(XCLBIN))?;
    let admin: SharedClient = device.create_client(1)?;
    let cfg: ExecBuffer = ExecBuffer::new(
        ConfigurePacket {
            slot_size: 0x1000,
            cu_shift: 16,
            cu_base_addr: CU_STRIDE,
            features: ConfigFeatures::default(),
            cu_addrs: (1..=NUM_CUS).map(|ix| ix * CU_STRIDE).collect(),
        }
        .to_words(),
    );
    device.execute(&admin, &cfg, &[])?;
    if !device.wait_for_completion(&admin, WAIT) {
        anyhow::bail!("configure did not complete");
    }
    ::kds::ensure_eq!(cfg.state(), Some(CommandState::Completed));
    device.destroy_client(&admin);

    Ok(Card {
        scheduler,
        device,
        bar,
        copies,
    })
}

fn start_cu(cu_mask: u32, arg: u32) -> ExecBuffer {
    ExecBuffer::new(
        StartKernelPacket {
            opcode: Opcode::StartCu,
            cu_masks: vec![cu_mask],
            regmap: vec![0, 0, 0, 0, arg, 0],
        }
        .to_words(),
    )
}

fn auto_complete(bar: &MemoryRegion, cu_idx: u32) {
    bar.set_auto_complete(((cu_idx + 1) * CU_STRIDE) as usize, AP_DONE | AP_IDLE);
}

//======================================================================================================================
// Tests
//======================================================================================================================

/// Several processes share the card, each driving its own CU from its own thread.
#[test]
fn concurrent_clients_complete_their_commands() -> Result<()> {
    const NUM_CMDS: usize = 64;
    let card: Card = card(Tunables::default())?;
    for cu_idx in 0..NUM_CUS {
        auto_complete(&card.bar, cu_idx);
    }
    let device: Arc<Device> = Arc::new(card.device);

    let (tx, rx): (Sender<(u32, usize)>, Receiver<(u32, usize)>) = crossbeam_channel::unbounded();
    let mut workers: Vec<JoinHandle<Result<()>>> = Vec::new();
    for cu_idx in 0..NUM_CUS {
        let device: Arc<Device> = device.clone();
        let tx: Sender<(u32, usize)> = tx.clone();
        workers.push(thread::spawn(move || -> Result<()> {
            let client: SharedClient = device.create_client(100 + cu_idx)?;
            device.alloc_context(&client, XclbinId::from(XCLBIN), CuIndex::Physical(cu_idx as usize), false)?;

            let mut completed: usize = 0;
            for n in 0..NUM_CMDS {
                let buffer: ExecBuffer = start_cu(1 << cu_idx, n as u32);
                device.execute(&client, &buffer, &[])?;
                if !device.wait_for_completion(&client, WAIT) {
                    anyhow::bail!("command {} on CU {} timed out", n, cu_idx);
                }
                ::kds::ensure_eq!(buffer.state(), Some(CommandState::Completed));
                completed += 1;
            }

            device.free_context(&client, XclbinId::from(XCLBIN), CuIndex::Physical(cu_idx as usize))?;
            device.destroy_client(&client);
            tx.send((cu_idx, completed))?;
            Ok(())
        }));
    }
    drop(tx);

    for worker in workers {
        match worker.join() {
            Ok(result) => result?,
            Err(_) => anyhow::bail!("client thread panicked"),
        }
    }
    let mut total: usize = 0;
    for (_, completed) in rx.iter() {
        total += completed;
    }
    ::kds::ensure_eq!(total, NUM_CUS as usize * NUM_CMDS);
    ::kds::ensure_eq!(device.notifier().outstanding(), 0);
    ::kds::ensure_eq!(device.num_clients(), 0);
    for cu in device.diagnostics().cus.iter() {
        ::kds::ensure_eq!(cu.usage as usize, NUM_CMDS);
    }

    device.detach();
    card.scheduler.shutdown();
    ::kds::ensure_eq!(card.scheduler.is_running(), false);
    Ok(())
}

/// A chain of dependent commands spread over every CU retires in submission order.
#[test]
fn dependency_chain_retires_in_order() -> Result<()> {
    let card: Card = card(Tunables::default())?;
    for cu_idx in 0..NUM_CUS {
        auto_complete(&card.bar, cu_idx);
    }
    let client: SharedClient = card.device.create_client(7)?;
    for cu_idx in 0..NUM_CUS {
        card.device
            .alloc_context(&client, XclbinId::from(XCLBIN), CuIndex::Physical(cu_idx as usize), true)?;
    }

    let mut chain: Vec<ExecBuffer> = Vec::new();
    for n in 0..16 {
        let buffer: ExecBuffer = start_cu(0b1111, n);
        let deps: Vec<ExecBuffer> = chain.last().cloned().into_iter().collect();
        card.device.execute(&client, &buffer, &deps)?;
        chain.push(buffer);
    }
    let mut seen: usize = 0;
    while seen < chain.len() {
        if !card.device.wait_for_completion(&client, WAIT) {
            anyhow::bail!("chain stalled after {} commands", seen);
        }
        seen += 1;
    }
    for buffer in chain.iter() {
        ::kds::ensure_eq!(buffer.state(), Some(CommandState::Completed));
    }
    let usage: u32 = card.device.diagnostics().cus.iter().map(|cu| cu.usage).sum();
    ::kds::ensure_eq!(usage, 16);

    card.device.destroy_client(&client);
    card.scheduler.shutdown();
    Ok(())
}

/// Buffer copies never reach a CU, they run on the host.
#[test]
fn copies_run_on_the_host() -> Result<()> {
    let card: Card = card(Tunables::default())?;
    let client: SharedClient = card.device.create_client(8)?;
    let words: Vec<u32> = vec![
        PacketHeader::new(Opcode::StartCopyBo, CommandType::Default, 3).raw(),
        0x1000,
        0x2000,
        0x40,
    ];
    let copy: ExecBuffer = ExecBuffer::new(words);
    card.device.execute(&client, &copy, &[])?;
    if !card.device.wait_for_completion(&client, WAIT) {
        anyhow::bail!("copy did not complete");
    }
    ::kds::ensure_eq!(copy.state(), Some(CommandState::Completed));
    ::kds::ensure_eq!(copy.header().cmd_type(), Some(CommandType::KdsLocal));
    ::kds::ensure_eq!(card.copies.copies.load(Ordering::Acquire), 1);
    ::kds::ensure_eq!(runtime::lock(&card.copies.last).get(1..).map(|w| w.to_vec()), Some(vec![0x1000, 0x2000, 0x40]));

    card.device.destroy_client(&client);
    card.scheduler.shutdown();
    Ok(())
}

/// Stopping a card whose CU hangs flushes the stuck command.
#[test]
fn stop_flushes_a_hung_cu() -> Result<()> {
    let tunables: Tunables = Tunables {
        stop_retries: 2,
        stop_interval: Duration::from_millis(5),
        flush_wait: Duration::from_secs(2),
        ..Tunables::default()
    };
    let card: Card = card(tunables)?;
    let client: SharedClient = card.device.create_client(9)?;
    card.device
        .alloc_context(&client, XclbinId::from(XCLBIN), CuIndex::Physical(0), true)?;

    let hung: ExecBuffer = start_cu(0b1, 0);
    card.device.execute(&client, &hung, &[])?;
    card.device.stop();
    ::kds::ensure_eq!(hung.state(), Some(CommandState::Abort));
    ::kds::ensure_eq!(card.device.notifier().outstanding(), 0);
    match card.device.execute(&client, &start_cu(0b1, 1), &[]) {
        Err(e) if e.errno == libc::EBUSY => (),
        other => anyhow::bail!("stopped card admitted a command: {:?}", other),
    }

    card.device.destroy_client(&client);
    card.scheduler.shutdown();
    Ok(())
}

/// Scheduler settings come from a configuration file.
#[test]
fn tunables_from_configuration_file() -> Result<()> {
    let path: ::std::path::PathBuf = ::std::env::temp_dir().join(format!("kds-{}.yaml", ::std::process::id()));
    ::std::fs::write(&path, "kds:\n  worker_thread: false\n  client_timeout_loops: 3\n")?;
    let config: Config = Config::new(path.to_string_lossy().as_ref())?;
    ::std::fs::remove_file(&path)?;

    let tunables: Tunables = config.tunables()?;
    ::kds::ensure_eq!(tunables.worker_thread, false);
    ::kds::ensure_eq!(tunables.client_timeout_loops, 3);

    // Without a worker nothing runs until the owner drives the scheduler.
    let scheduler: Scheduler = Scheduler::new(tunables);
    let bar: Arc<MemoryRegion> = Arc::new(MemoryRegion::new(0x10_0000));
    let res: ExecResources = ExecResources::new(
        bar.clone(),
        Arc::new(MemoryRegion::new(0x100)),
        Arc::new(MemoryRegion::new(0x1_0000)),
        0x1_0000,
    );
    let device: Device = Device::new(&scheduler, res)?;
    ::kds::ensure_eq!(scheduler.is_running(), false);
    let client: SharedClient = device.create_client(10)?;
    let cfg: ExecBuffer = ExecBuffer::new(
        ConfigurePacket {
            slot_size: 0x1000,
            cu_shift: 16,
            cu_base_addr: CU_STRIDE,
            features: ConfigFeatures::default(),
            cu_addrs: vec![CU_STRIDE],
        }
        .to_words(),
    );
    device.execute(&client, &cfg, &[])?;
    ::kds::ensure_eq!(cfg.state(), Some(CommandState::New));
    scheduler.run_once();
    ::kds::ensure_eq!(cfg.state(), Some(CommandState::Completed));
    ::kds::ensure_eq!(device.poll_client(&client), true);
    device.destroy_client(&client);
    Ok(())
}
