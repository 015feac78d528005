#[cfg(test)]
mod tests {
    use crate::{
        defs::{
            msr, CR0_PE, CR0_PG, CR4_PAE, EFER_LMA, EFER_LME, EFER_SVME, RFLAGS_IF,
            RFLAGS_RESERVED_1, RFLAGS_TF,
        },
        exit::{EntryFailure, ExitResolution, FaultAccess, IoAccess, VCpuExitReason},
        hal::{AxVmmHal, CpuidResult, HostState, VirtMode},
        mem::{GuestPhysAddr, MemoryRange},
        regs::{GuestRegs, RegMask, SegReg},
        svm::vmcb::{exit_code, ControlArea, SaveArea},
        vcpu::VCpuState,
        vmm::{AxVmm, RunParams, VmCreateParams, VmInfoResult},
        vmx::vmcs::{self, reason},
        CallerId, VMId,
    };
    use axerrno::{AxError, AxResult};
    use memory_addr::{PhysAddr, VirtAddr, PAGE_SIZE_4K};
    use std::{
        alloc::{alloc_zeroed, dealloc, Layout},
        cell::Cell,
        collections::{HashMap, VecDeque},
        mem::{offset_of, size_of},
        sync::{
            atomic::{AtomicBool, Ordering},
            mpsc, Arc, Mutex,
        },
        thread,
        time::Duration,
    };

    const CALLER: CallerId = 7;
    const OTHER_CALLER: CallerId = 8;
    const MIB: usize = 1 << 20;
    const RESET_RIP: u64 = 0xfff0;

    thread_local! {
        static CURRENT_CPU: Cell<usize> = const { Cell::new(0) };
        static CURRENT_VMCS: Cell<Option<usize>> = const { Cell::new(None) };
    }

    fn set_current_cpu(cpu: usize) {
        CURRENT_CPU.with(|c| c.set(cpu));
    }

    /// What the guest does on the next entry.
    #[derive(Debug, Clone, Copy)]
    enum Exit {
        Hlt,
        Cpuid { leaf: u32 },
        PortIn { port: u16, size: u8 },
        PortOut { port: u16, size: u8, value: u64 },
        Vmcall,
        /// `MOV` to or from a control register, with `value` in RAX.
        CrAccess { qual: u64, value: u64 },
        Rdmsr { index: u32 },
        Wrmsr { index: u32, value: u64 },
        NestedFault { gpa: usize, write: bool },
        InterruptWindow,
        ExternalInterrupt { vector: u8 },
        EntryFailure,
    }

    /// What the control block looked like at an entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct EntryRecord {
        injected: Option<u32>,
        window: bool,
        rip: u64,
        long_mode: bool,
    }

    /// Parks the next entry until the test lets it go.
    struct Gate {
        entered: mpsc::Sender<()>,
        release: mpsc::Receiver<()>,
    }

    // Mock host: memory from the test process, VMCS fields in a map, and
    // guest behavior scripted as a queue of exits.
    struct MockHal {
        mode: Option<VirtMode>,
        asids: u32,
        frames: Mutex<HashMap<usize, usize>>,
        alloc_budget: Mutex<Option<usize>>,
        vmcs: Mutex<HashMap<(usize, u32), u64>>,
        guest_pages: Mutex<HashMap<(VMId, usize), Box<[u8]>>>,
        exits: Mutex<VecDeque<(Exit, Option<u64>)>>,
        entries: Mutex<Vec<EntryRecord>>,
        gate: Mutex<Option<Gate>>,
        fail_vmclear: AtomicBool,
        fail_resolve: AtomicBool,
        yield_once: AtomicBool,
        must_stop: AtomicBool,
        // Track calls for testing
        call_log: Mutex<Vec<String>>,
    }

    impl MockHal {
        fn new(mode: Option<VirtMode>) -> Self {
            Self {
                mode,
                asids: 16,
                frames: Mutex::new(HashMap::new()),
                alloc_budget: Mutex::new(None),
                vmcs: Mutex::new(HashMap::new()),
                guest_pages: Mutex::new(HashMap::new()),
                exits: Mutex::new(VecDeque::new()),
                entries: Mutex::new(Vec::new()),
                gate: Mutex::new(None),
                fail_vmclear: AtomicBool::new(false),
                fail_resolve: AtomicBool::new(false),
                yield_once: AtomicBool::new(false),
                must_stop: AtomicBool::new(false),
                call_log: Mutex::new(Vec::new()),
            }
        }

        fn log(&self, entry: String) {
            self.call_log.lock().unwrap().push(entry);
        }

        fn calls(&self, entry: &str) -> usize {
            self.call_log
                .lock()
                .unwrap()
                .iter()
                .filter(|e| *e == entry)
                .count()
        }

        fn push_exit(&self, exit: Exit) {
            self.exits.lock().unwrap().push_back((exit, None));
        }

        fn push_exit_with_rflags(&self, exit: Exit, rflags: u64) {
            self.exits.lock().unwrap().push_back((exit, Some(rflags)));
        }

        fn next_exit(&self) -> (Exit, Option<u64>) {
            self.exits
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or((Exit::Hlt, None))
        }

        fn entries(&self) -> Vec<EntryRecord> {
            self.entries.lock().unwrap().clone()
        }

        fn outstanding_frames(&self) -> usize {
            self.frames.lock().unwrap().values().sum()
        }

        fn set_alloc_budget(&self, frames: Option<usize>) {
            *self.alloc_budget.lock().unwrap() = frames;
        }

        /// Arm the gate: returns a receiver signalled once the next entry
        /// starts, and the sender that lets it finish.
        fn arm_gate(&self) -> (mpsc::Receiver<()>, mpsc::Sender<()>) {
            let (entered_tx, entered_rx) = mpsc::channel();
            let (release_tx, release_rx) = mpsc::channel();
            *self.gate.lock().unwrap() = Some(Gate {
                entered: entered_tx,
                release: release_rx,
            });
            (entered_rx, release_tx)
        }

        fn wait_at_gate(&self) {
            let gate = self.gate.lock().unwrap().take();
            if let Some(gate) = gate {
                gate.entered.send(()).unwrap();
                gate.release.recv().unwrap();
            }
        }

        fn current_vmcs() -> AxResult<usize> {
            CURRENT_VMCS.with(|c| c.get()).ok_or(AxError::BadState)
        }
    }

    impl AxVmmHal for MockHal {
        fn alloc_frames(&self, count: usize) -> Option<PhysAddr> {
            {
                let mut budget = self.alloc_budget.lock().unwrap();
                if let Some(left) = budget.as_mut() {
                    if *left < count {
                        return None;
                    }
                    *left -= count;
                }
            }
            let layout = Layout::from_size_align(count * PAGE_SIZE_4K, PAGE_SIZE_4K).unwrap();
            let ptr = unsafe { alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            self.frames.lock().unwrap().insert(ptr as usize, count);
            Some(PhysAddr::from_usize(ptr as usize))
        }

        fn dealloc_frames(&self, paddr: PhysAddr, count: usize) {
            let recorded = self.frames.lock().unwrap().remove(&paddr.as_usize());
            assert_eq!(recorded, Some(count), "freeing {paddr:#x}");
            let layout = Layout::from_size_align(count * PAGE_SIZE_4K, PAGE_SIZE_4K).unwrap();
            unsafe { dealloc(paddr.as_usize() as *mut u8, layout) };
        }

        fn phys_to_virt(&self, paddr: PhysAddr) -> VirtAddr {
            VirtAddr::from_usize(paddr.as_usize())
        }

        fn virt_mode(&self) -> Option<VirtMode> {
            self.mode
        }

        fn rdmsr(&self, index: u32) -> u64 {
            match index {
                msr::IA32_VMX_BASIC => (1 << 55) | 0x12,
                // Every control bit may be 0 or 1.
                msr::IA32_VMX_TRUE_PINBASED_CTLS
                | msr::IA32_VMX_TRUE_PROCBASED_CTLS
                | msr::IA32_VMX_TRUE_EXIT_CTLS
                | msr::IA32_VMX_TRUE_ENTRY_CTLS
                | msr::IA32_VMX_PROCBASED_CTLS2 => 0xffff_ffff_0000_0000,
                msr::IA32_VMX_CR0_FIXED0 => 0x8000_0021,
                msr::IA32_VMX_CR0_FIXED1 => 0xffff_ffff,
                msr::IA32_VMX_CR4_FIXED0 => 0x2000,
                msr::IA32_VMX_CR4_FIXED1 => 0x3767ff,
                msr::IA32_VMX_EPT_VPID_CAP => (1 << 6) | (1 << 14) | (1 << 21),
                _ => 0,
            }
        }

        fn cpuid(&self, leaf: u32, _subleaf: u32) -> CpuidResult {
            match leaf {
                0xd => CpuidResult {
                    eax: 0b111,
                    ..Default::default()
                },
                0x8000_000a => CpuidResult {
                    ebx: self.asids,
                    edx: 1 << 3,
                    ..Default::default()
                },
                _ => CpuidResult::default(),
            }
        }

        fn host_state(&self) -> HostState {
            HostState::default()
        }

        fn cpu_count(&self) -> usize {
            2
        }

        fn current_cpu(&self) -> usize {
            CURRENT_CPU.with(|c| c.get())
        }

        fn hardware_enable(&self, cpu: usize) -> AxResult {
            self.log(format!("enable({cpu})"));
            Ok(())
        }

        fn hardware_disable(&self, cpu: usize) -> AxResult {
            self.log(format!("disable({cpu})"));
            Ok(())
        }

        fn should_yield(&self) -> bool {
            self.yield_once.swap(false, Ordering::SeqCst)
        }

        fn yield_now(&self) {
            self.log("yield".to_string());
            thread::sleep(Duration::from_millis(1));
        }

        fn caller_must_stop(&self) -> bool {
            self.must_stop.load(Ordering::SeqCst)
        }

        fn notify_cpu(&self, cpu: usize) {
            self.log(format!("notify({cpu})"));
        }

        fn handle_host_irq(&self, vector: u8) {
            self.log(format!("host_irq({vector:#x})"));
        }

        fn map_guest_memory(&self, vm_id: VMId, ranges: &[MemoryRange]) -> AxResult<PhysAddr> {
            self.log(format!("map({vm_id}, {})", ranges.len()));
            Ok(PhysAddr::from_usize(0x4000_0000 + vm_id * 0x10_0000))
        }

        fn unmap_guest_memory(&self, vm_id: VMId) {
            self.log(format!("unmap({vm_id})"));
            self.guest_pages.lock().unwrap().retain(|(id, _), _| *id != vm_id);
        }

        fn resolve_fault(&self, vm_id: VMId, gpa: GuestPhysAddr, access: FaultAccess) -> AxResult {
            self.log(format!("resolve({vm_id}, {:#x}, {access:?})", gpa.as_usize()));
            if self.fail_resolve.load(Ordering::SeqCst) {
                return Err(AxError::NoMemory);
            }
            let page = gpa.as_usize() & !(PAGE_SIZE_4K - 1);
            self.guest_pages
                .lock()
                .unwrap()
                .entry((vm_id, page))
                .or_insert_with(|| vec![0; PAGE_SIZE_4K].into_boxed_slice());
            Ok(())
        }

        fn translate_guest(&self, vm_id: VMId, gpa: GuestPhysAddr) -> Option<PhysAddr> {
            let mut pages = self.guest_pages.lock().unwrap();
            let page = pages.get_mut(&(vm_id, gpa.as_usize()))?;
            Some(PhysAddr::from_usize(page.as_mut_ptr() as usize))
        }

        fn vmptrld(&self, vmcs: PhysAddr) -> AxResult {
            CURRENT_VMCS.with(|c| c.set(Some(vmcs.as_usize())));
            Ok(())
        }

        fn vmclear(&self, vmcs: PhysAddr) -> AxResult {
            if self.fail_vmclear.load(Ordering::SeqCst) {
                return Err(AxError::BadState);
            }
            CURRENT_VMCS.with(|c| {
                if c.get() == Some(vmcs.as_usize()) {
                    c.set(None);
                }
            });
            Ok(())
        }

        fn vmread(&self, field: u32) -> AxResult<u64> {
            let vmcs = Self::current_vmcs()?;
            Ok(self
                .vmcs
                .lock()
                .unwrap()
                .get(&(vmcs, field))
                .copied()
                .unwrap_or(0))
        }

        fn vmwrite(&self, field: u32, value: u64) -> AxResult {
            let vmcs = Self::current_vmcs()?;
            self.vmcs.lock().unwrap().insert((vmcs, field), value);
            Ok(())
        }

        fn vmx_enter_guest(&self, _launched: bool, regs: &mut GuestRegs) -> Result<(), EntryFailure> {
            self.wait_at_gate();
            let vmcs = Self::current_vmcs().map_err(|_| EntryFailure::InvalidControlBlock)?;
            let (exit, rflags) = self.next_exit();

            let mut fields = self.vmcs.lock().unwrap();
            let get = |fields: &HashMap<(usize, u32), u64>, f: u32| {
                fields.get(&(vmcs, f)).copied().unwrap_or(0)
            };
            let info = get(&fields, vmcs::VMENTRY_INTERRUPTION_INFO);
            self.entries.lock().unwrap().push(EntryRecord {
                injected: (info & (1 << 31) != 0).then_some(info as u32),
                window: get(&fields, vmcs::PROCBASED_CTLS) & (1 << 2) != 0,
                rip: get(&fields, vmcs::GUEST_RIP),
                long_mode: get(&fields, vmcs::VMENTRY_CTLS) & (1 << 9) != 0,
            });
            // The processor clears the valid bit on a successful entry.
            fields.insert((vmcs, vmcs::VMENTRY_INTERRUPTION_INFO), 0);
            if let Some(rflags) = rflags {
                fields.insert((vmcs, vmcs::GUEST_RFLAGS), rflags);
            }

            let mut qual = 0u64;
            let mut len = 0u64;
            let mut gpa = 0u64;
            let mut intr_info = 0u64;
            let reason = match exit {
                Exit::Hlt => {
                    len = 1;
                    reason::HLT
                }
                Exit::Cpuid { leaf } => {
                    regs.gprs.rax = leaf as u64;
                    regs.gprs.rcx = 0;
                    len = 2;
                    reason::CPUID
                }
                Exit::PortIn { port, size } => {
                    qual = (size as u64 - 1) | (1 << 3) | ((port as u64) << 16);
                    len = 1;
                    reason::IO_INSTRUCTION
                }
                Exit::PortOut { port, size, value } => {
                    regs.gprs.rax = value;
                    qual = (size as u64 - 1) | ((port as u64) << 16);
                    len = 1;
                    reason::IO_INSTRUCTION
                }
                Exit::Vmcall => {
                    len = 3;
                    reason::VMCALL
                }
                Exit::CrAccess { qual: q, value } => {
                    regs.gprs.rax = value;
                    qual = q;
                    len = 3;
                    reason::CR_ACCESS
                }
                Exit::Rdmsr { index } => {
                    regs.gprs.rcx = index as u64;
                    len = 2;
                    reason::RDMSR
                }
                Exit::Wrmsr { index, value } => {
                    regs.gprs.rcx = index as u64;
                    regs.gprs.rax = value & 0xffff_ffff;
                    regs.gprs.rdx = value >> 32;
                    len = 2;
                    reason::WRMSR
                }
                Exit::NestedFault { gpa: addr, write } => {
                    qual = (write as u64) << 1;
                    gpa = addr as u64;
                    reason::EPT_VIOLATION
                }
                Exit::InterruptWindow => reason::INTERRUPT_WINDOW,
                Exit::ExternalInterrupt { vector } => {
                    intr_info = (1 << 31) | vector as u64;
                    reason::EXTERNAL_INTERRUPT
                }
                Exit::EntryFailure => return Err(EntryFailure::ValidControlBlock { code: 7 }),
            };
            fields.insert((vmcs, vmcs::EXIT_REASON), reason as u64);
            fields.insert((vmcs, vmcs::EXIT_QUALIFICATION), qual);
            fields.insert((vmcs, vmcs::VMEXIT_INSTRUCTION_LEN), len);
            fields.insert((vmcs, vmcs::GUEST_PHYSICAL_ADDR), gpa);
            fields.insert((vmcs, vmcs::VMEXIT_INTERRUPTION_INFO), intr_info);
            Ok(())
        }

        fn svm_enter_guest(&self, vmcb: PhysAddr, regs: &mut GuestRegs) -> Result<(), EntryFailure> {
            self.wait_at_gate();
            let (exit, rflags) = self.next_exit();

            let base = vmcb.as_usize();
            let ctl = |field: usize| (base + field) as *mut u64;
            let save = |field: usize| (base + size_of::<ControlArea>() + field) as *mut u64;
            // SAFETY: `vmcb` is a frame from `alloc_frames`, identity mapped.
            unsafe {
                let event = ctl(offset_of!(ControlArea, event_inj)).read();
                let misc1 = (ctl(offset_of!(ControlArea, intercept_misc1)) as *const u32).read();
                let rip = save(offset_of!(SaveArea, rip)).read();
                let efer = save(offset_of!(SaveArea, efer)).read();
                self.entries.lock().unwrap().push(EntryRecord {
                    injected: (event & (1 << 31) != 0).then_some(event as u32),
                    window: misc1 & (1 << 4) != 0,
                    rip,
                    long_mode: efer & EFER_LMA != 0,
                });
                if let Some(rflags) = rflags {
                    save(offset_of!(SaveArea, rflags)).write(rflags);
                }

                let mut info1 = 0u64;
                let mut info2 = 0u64;
                let mut len = 0u64;
                let code = match exit {
                    Exit::Hlt => {
                        len = 1;
                        exit_code::HLT
                    }
                    Exit::Cpuid { leaf } => {
                        save(offset_of!(SaveArea, rax)).write(leaf as u64);
                        regs.gprs.rcx = 0;
                        len = 2;
                        exit_code::CPUID
                    }
                    Exit::PortIn { port, size } => {
                        info1 = 1 | ((size as u64) << 4) | ((port as u64) << 16);
                        info2 = rip + 1;
                        exit_code::IOIO
                    }
                    Exit::PortOut { port, size, value } => {
                        save(offset_of!(SaveArea, rax)).write(value);
                        info1 = ((size as u64) << 4) | ((port as u64) << 16);
                        info2 = rip + 1;
                        exit_code::IOIO
                    }
                    Exit::Vmcall => {
                        len = 3;
                        exit_code::VMMCALL
                    }
                    // Control registers are not intercepted.
                    Exit::CrAccess { .. } => unreachable!("CR access exit on SVM"),
                    Exit::Rdmsr { index } => {
                        regs.gprs.rcx = index as u64;
                        len = 2;
                        exit_code::MSR
                    }
                    Exit::Wrmsr { index, value } => {
                        regs.gprs.rcx = index as u64;
                        save(offset_of!(SaveArea, rax)).write(value & 0xffff_ffff);
                        regs.gprs.rdx = value >> 32;
                        info1 = 1;
                        len = 2;
                        exit_code::MSR
                    }
                    Exit::NestedFault { gpa, write } => {
                        info1 = (write as u64) << 1;
                        info2 = gpa as u64;
                        exit_code::NPF
                    }
                    Exit::InterruptWindow => exit_code::VINTR,
                    Exit::ExternalInterrupt { .. } => exit_code::INTR,
                    Exit::EntryFailure => exit_code::INVALID,
                };
                ctl(offset_of!(ControlArea, exit_code)).write(code);
                ctl(offset_of!(ControlArea, exit_info_1)).write(info1);
                ctl(offset_of!(ControlArea, exit_info_2)).write(info2);
                ctl(offset_of!(ControlArea, next_rip)).write(rip + len);
            }
            Ok(())
        }
    }

    fn create_vmm(mode: VirtMode) -> (Arc<MockHal>, Arc<AxVmm<MockHal>>) {
        let hal = Arc::new(MockHal::new(Some(mode)));
        let vmm = AxVmm::new(hal.clone()).unwrap();
        (hal, Arc::new(vmm))
    }

    fn ram(mb: usize) -> Vec<MemoryRange> {
        vec![MemoryRange::new(0, 0x1_0000_0000, mb * MIB)]
    }

    fn create_vm(vmm: &AxVmm<MockHal>, caller: CallerId, name: &str, vcpus: usize) -> VMId {
        let params = VmCreateParams {
            name: name.into(),
            memory_ranges: ram(4),
            vcpu_count: vcpus,
        };
        vmm.create_vm(caller, &params).unwrap().vm_id
    }

    fn run(vmm: &AxVmm<MockHal>, vm_id: VMId) -> AxResult<VCpuExitReason> {
        vmm.run_vcpu(CALLER, &RunParams::new(vm_id, 0))
            .map(|report| report.reason)
    }

    #[test]
    fn test_vmm_requires_hardware_virtualization() {
        for mode in [None, Some(VirtMode::Vmx), Some(VirtMode::Svm)] {
            let hal = Arc::new(MockHal::new(mode));
            assert_eq!(AxVmm::new(hal.clone()).err(), Some(AxError::Unsupported));
            assert_eq!(hal.calls("enable(0)"), 0);
        }

        let mut hal = MockHal::new(Some(VirtMode::Rvi));
        hal.asids = 1;
        assert_eq!(AxVmm::new(Arc::new(hal)).err(), Some(AxError::Unsupported));
    }

    #[test]
    fn test_vmm_enables_and_disables_every_cpu() {
        let (hal, vmm) = create_vmm(VirtMode::Ept);
        assert_eq!(hal.calls("enable(0)"), 1);
        assert_eq!(hal.calls("enable(1)"), 1);
        assert!(vmm.context().percpu().iter().all(|cpu| cpu.is_enabled()));

        create_vm(&vmm, CALLER, "guest", 1);
        vmm.shutdown();
        vmm.shutdown();
        assert_eq!(hal.calls("unmap(1)"), 1);
        assert_eq!(hal.calls("disable(0)"), 1);
        assert_eq!(hal.calls("disable(1)"), 1);
        assert!(vmm.context().percpu().iter().all(|cpu| !cpu.is_enabled()));

        let params = VmCreateParams {
            name: "late".into(),
            memory_ranges: ram(4),
            vcpu_count: 1,
        };
        assert_eq!(vmm.create_vm(CALLER, &params), Err(AxError::BadState));
        drop(vmm);
        assert_eq!(hal.calls("disable(0)"), 1);
        assert_eq!(hal.outstanding_frames(), 0);
    }

    #[test]
    fn test_create_vm() {
        let (hal, vmm) = create_vmm(VirtMode::Ept);
        let params = VmCreateParams {
            name: "guest".into(),
            memory_ranges: vec![
                MemoryRange::new(0, 0x1_0000_0000, 3 * MIB),
                MemoryRange::new(3 * MIB, 0x2_0000_0000, MIB),
            ],
            vcpu_count: 2,
        };
        let created = vmm.create_vm(CALLER, &params).unwrap();
        assert_eq!(created.vm_id, 1);
        assert_eq!(created.memory_size_mb, 4);
        assert_eq!(hal.calls("map(1, 2)"), 1);
        assert_eq!(vmm.context().vpids().outstanding(), 2);

        let vm = vmm.lookup(CALLER, 1).unwrap();
        assert_eq!(vm.name(), "guest");
        assert_eq!(vm.vcpu_states(), vec![VCpuState::Stopped; 2]);
        assert_eq!(vm.vcpu(2).err(), Some(AxError::NotFound));
    }

    #[test]
    fn test_create_vm_rejects_bad_parameters() {
        let (hal, vmm) = create_vmm(VirtMode::Ept);
        let overlapping = VmCreateParams {
            name: "bad".into(),
            memory_ranges: vec![
                MemoryRange::new(0, 0x1_0000_0000, 2 * MIB),
                MemoryRange::new(MIB, 0x2_0000_0000, MIB),
            ],
            vcpu_count: 1,
        };
        assert_eq!(vmm.create_vm(CALLER, &overlapping), Err(AxError::InvalidInput));

        let mut params = VmCreateParams {
            name: "x".repeat(65),
            memory_ranges: ram(4),
            vcpu_count: 1,
        };
        assert_eq!(vmm.create_vm(CALLER, &params), Err(AxError::InvalidInput));
        params.name = "guest".into();
        params.vcpu_count = 0;
        assert_eq!(vmm.create_vm(CALLER, &params), Err(AxError::InvalidInput));
        params.vcpu_count = 65;
        assert_eq!(vmm.create_vm(CALLER, &params), Err(AxError::InvalidInput));

        // Nothing was mapped and no id was consumed.
        assert_eq!(hal.calls("map(1, 1)"), 0);
        assert_eq!(create_vm(&vmm, CALLER, "guest", 1), 1);
    }

    #[test]
    fn test_create_vm_rolls_back_on_allocation_failure() {
        let (hal, vmm) = create_vmm(VirtMode::Ept);
        // Enough for the first vcpu's four pages, not the second's.
        hal.set_alloc_budget(Some(6));
        let params = VmCreateParams {
            name: "guest".into(),
            memory_ranges: ram(4),
            vcpu_count: 2,
        };
        assert_eq!(vmm.create_vm(CALLER, &params), Err(AxError::NoMemory));
        assert_eq!(hal.outstanding_frames(), 0);
        assert_eq!(hal.calls("unmap(1)"), 1);
        assert_eq!(vmm.context().vpids().outstanding(), 0);

        hal.set_alloc_budget(None);
        assert_eq!(create_vm(&vmm, CALLER, "guest", 2), 1);
    }

    #[test]
    fn test_get_info_and_permissions() {
        let (_hal, vmm) = create_vmm(VirtMode::Ept);
        let a = create_vm(&vmm, CALLER, "a", 1);
        let b = create_vm(&vmm, CALLER, "b", 2);
        let c = create_vm(&vmm, OTHER_CALLER, "c", 1);
        assert_eq!((a, b, c), (1, 2, 3));

        assert_eq!(vmm.get_info(CALLER, 1).unwrap(), VmInfoResult::RequiredSize(2));
        let VmInfoResult::Info(info) = vmm.get_info(CALLER, 8).unwrap() else {
            panic!("expected summaries");
        };
        assert_eq!(info.len(), 2);
        assert_eq!(info[1].name, "b");
        assert_eq!(info[1].memory_size_mb, 4);
        assert_eq!(info[1].vcpu_states, vec![VCpuState::Stopped; 2]);
        assert_eq!(info[1].creator, CALLER);

        assert_eq!(
            vmm.run_vcpu(OTHER_CALLER, &RunParams::new(a, 0)).err(),
            Some(AxError::PermissionDenied)
        );
        assert_eq!(vmm.terminate_vm(CALLER, c), Err(AxError::PermissionDenied));
        assert_eq!(vmm.terminate_vm(CALLER, 42), Err(AxError::NotFound));
        assert_eq!(
            vmm.read_registers(CALLER, a, 1, RegMask::ALL).err(),
            Some(AxError::NotFound)
        );
    }

    #[test]
    fn test_run_fresh_vcpu_halts() {
        let (hal, vmm) = create_vmm(VirtMode::Ept);
        let vm = create_vm(&vmm, CALLER, "guest", 1);
        let report = vmm.run_vcpu(CALLER, &RunParams::new(vm, 0)).unwrap();
        assert_eq!(report.reason, VCpuExitReason::Halt);
        assert_eq!(report.regs.rip, RESET_RIP + 1);
        assert_eq!(report.regs.seg(SegReg::Cs).selector, 0xf000);
        assert!(!report.irq_ready);
        assert_eq!(hal.entries()[0].rip, RESET_RIP);

        let vcpu = vmm.lookup(CALLER, vm).unwrap().vcpu(0).unwrap();
        assert_eq!(vcpu.state(), VCpuState::Stopped);
        assert_eq!(vcpu.last_cpu(), Some(0));
        // Released after the run.
        assert_eq!(vmm.context().percpu().get(0).unwrap().loaded(), None);
    }

    #[test]
    fn test_cpuid_and_single_step() {
        let (hal, vmm) = create_vmm(VirtMode::Ept);
        let vm = create_vm(&vmm, CALLER, "guest", 1);
        let mut regs = vmm.read_registers(CALLER, vm, 0, RegMask::GPRS).unwrap();
        regs.rflags |= RFLAGS_TF;
        vmm.write_registers(CALLER, vm, 0, RegMask::GPRS, &regs).unwrap();

        hal.push_exit(Exit::Cpuid { leaf: 0x4000_0000 });
        let report = vmm.run_vcpu(CALLER, &RunParams::new(vm, 0)).unwrap();
        assert_eq!(report.reason, VCpuExitReason::Halt);
        assert_eq!(report.regs.gprs.rax, 0x4000_0000);
        assert_eq!(report.regs.gprs.rbx, u32::from_le_bytes(*b"AxVm") as u64);
        assert_eq!(report.regs.rip, RESET_RIP + 3);

        // The CPUID retired while single-stepping: #DB before the HLT.
        let entries = hal.entries();
        assert_eq!(entries[0].injected, None);
        assert_eq!(entries[1].injected, Some(0x8000_0301));
    }

    #[test]
    fn test_port_io_continuation() {
        let (hal, vmm) = create_vmm(VirtMode::Ept);
        let vm = create_vm(&vmm, CALLER, "guest", 1);
        let mut regs = vmm.read_registers(CALLER, vm, 0, RegMask::GPRS).unwrap();
        regs.gprs.rax = 0xdead_beef;
        vmm.write_registers(CALLER, vm, 0, RegMask::GPRS, &regs).unwrap();

        hal.push_exit(Exit::PortIn {
            port: 0x3f8,
            size: 1,
        });
        let report = vmm.run_vcpu(CALLER, &RunParams::new(vm, 0)).unwrap();
        assert_eq!(
            report.reason,
            VCpuExitReason::Io(IoAccess {
                port: 0x3f8,
                size: 1,
                is_in: true,
                string: false,
                rep: false,
                data: 0,
            })
        );
        assert_eq!(report.regs.rip, RESET_RIP + 1);

        let mut params = RunParams::new(vm, 0);
        params.resume = Some(ExitResolution::IoIn { data: 0x1ab });
        let report = vmm.run_vcpu(CALLER, &params).unwrap();
        assert_eq!(report.reason, VCpuExitReason::Halt);
        assert_eq!(report.regs.gprs.rax, 0xdead_beab);

        // A stale result is ignored.
        let report = vmm.run_vcpu(CALLER, &params).unwrap();
        assert_eq!(report.regs.gprs.rax, 0xdead_beab);
    }

    #[test]
    fn test_port_out_and_unclaimed_ports() {
        let (hal, vmm) = create_vmm(VirtMode::Ept);
        let vm = create_vm(&vmm, CALLER, "guest", 1);

        hal.push_exit(Exit::PortOut {
            port: 0x70,
            size: 1,
            value: 0x1234,
        });
        let VCpuExitReason::Io(io) = run(&vmm, vm).unwrap() else {
            panic!("expected port I/O");
        };
        assert!(!io.is_in);
        assert_eq!(io.data, 0x34);

        // Port 0x80 has no device: reads float high, writes vanish.
        hal.push_exit(Exit::PortOut {
            port: 0x80,
            size: 1,
            value: 0,
        });
        hal.push_exit(Exit::PortIn {
            port: 0x80,
            size: 2,
        });
        let report = vmm.run_vcpu(CALLER, &RunParams::new(vm, 0)).unwrap();
        assert_eq!(report.reason, VCpuExitReason::Halt);
        assert_eq!(report.regs.gprs.rax, 0xffff);
        assert_eq!(report.regs.rip, RESET_RIP + 4);
    }

    #[test]
    fn test_vmcall_injects_undefined_opcode() {
        let (hal, vmm) = create_vmm(VirtMode::Ept);
        let vm = create_vm(&vmm, CALLER, "guest", 1);
        hal.push_exit(Exit::Vmcall);
        let report = vmm.run_vcpu(CALLER, &RunParams::new(vm, 0)).unwrap();
        assert_eq!(report.reason, VCpuExitReason::Halt);
        // VMCALL did not retire, the HLT did.
        assert_eq!(report.regs.rip, RESET_RIP + 1);
        assert_eq!(hal.entries()[1].injected, Some(0x8000_0306));
    }

    #[test]
    fn test_external_interrupt_goes_to_host() {
        let (hal, vmm) = create_vmm(VirtMode::Ept);
        let vm = create_vm(&vmm, CALLER, "guest", 1);
        hal.push_exit(Exit::ExternalInterrupt { vector: 0x40 });
        assert_eq!(run(&vmm, vm), Ok(VCpuExitReason::Halt));
        assert_eq!(hal.calls("host_irq(0x40)"), 1);
    }

    #[test]
    fn test_nested_faults() {
        let (hal, vmm) = create_vmm(VirtMode::Ept);
        let vm = create_vm(&vmm, CALLER, "guest", 1);

        hal.push_exit(Exit::NestedFault {
            gpa: 0x1000,
            write: true,
        });
        assert_eq!(run(&vmm, vm), Ok(VCpuExitReason::Halt));
        assert_eq!(hal.calls("resolve(1, 0x1000, Write)"), 1);

        hal.push_exit(Exit::NestedFault {
            gpa: 0xfee0_0000,
            write: false,
        });
        let report = vmm.run_vcpu(CALLER, &RunParams::new(vm, 0)).unwrap();
        assert_eq!(
            report.reason,
            VCpuExitReason::Mmio {
                gpa: GuestPhysAddr::from_usize(0xfee0_0000),
                access: FaultAccess::Read,
            }
        );
        // Not retired: the caller emulates it.
        assert_eq!(report.regs.rip, RESET_RIP + 1);
    }

    #[test]
    fn test_fault_outside_guest_memory_kills_vm() {
        let (hal, vmm) = create_vmm(VirtMode::Ept);
        let vm = create_vm(&vmm, CALLER, "guest", 1);
        hal.push_exit(Exit::NestedFault {
            gpa: 0x1000_0000,
            write: false,
        });
        assert_eq!(run(&vmm, vm), Err(AxError::BadState));
        assert_eq!(hal.calls("unmap(1)"), 1);
        assert_eq!(run(&vmm, vm), Err(AxError::NotFound));
        assert_eq!(hal.outstanding_frames(), 0);
        assert_eq!(vmm.context().vpids().outstanding(), 0);
        // Other VMs are unaffected.
        assert!(!vmm.context().is_poisoned());
        let other = create_vm(&vmm, CALLER, "next", 1);
        assert_eq!(run(&vmm, other), Ok(VCpuExitReason::Halt));
    }

    #[test]
    fn test_unresolvable_fault_and_entry_failure_are_fatal() {
        let (hal, vmm) = create_vmm(VirtMode::Ept);
        let vm = create_vm(&vmm, CALLER, "guest", 1);
        hal.fail_resolve.store(true, Ordering::SeqCst);
        hal.push_exit(Exit::NestedFault {
            gpa: 0x2000,
            write: false,
        });
        assert_eq!(run(&vmm, vm), Err(AxError::BadState));
        assert_eq!(hal.calls("unmap(1)"), 1);

        let vm = create_vm(&vmm, CALLER, "guest", 1);
        hal.push_exit(Exit::EntryFailure);
        assert_eq!(run(&vmm, vm), Err(AxError::BadState));
        assert_eq!(hal.calls("unmap(2)"), 1);
    }

    #[test]
    fn test_interrupt_window_and_irq_ready() {
        let (hal, vmm) = create_vmm(VirtMode::Ept);
        let vm = create_vm(&vmm, CALLER, "guest", 1);
        vmm.set_pending_interrupt(CALLER, vm, 0, true).unwrap();

        // Interrupts are off at reset, so the window gets armed, and the
        // guest enabling them brings the vcpu back with IrqReady.
        hal.push_exit_with_rflags(Exit::Cpuid { leaf: 0 }, RFLAGS_RESERVED_1);
        hal.push_exit_with_rflags(Exit::InterruptWindow, RFLAGS_RESERVED_1 | RFLAGS_IF);
        let report = vmm.run_vcpu(CALLER, &RunParams::new(vm, 0)).unwrap();
        assert_eq!(report.reason, VCpuExitReason::IrqReady);
        assert!(report.irq_ready);
        assert!(hal.entries().iter().all(|e| e.window && e.injected.is_none()));

        vmm.set_pending_interrupt(CALLER, vm, 0, false).unwrap();
        let mut params = RunParams::new(vm, 0);
        params.resume = Some(ExitResolution::Acknowledged);
        params.irq = Some(0x30);
        assert_eq!(vmm.run_vcpu(CALLER, &params).unwrap().reason, VCpuExitReason::Halt);
        let last = hal.entries()[2];
        assert_eq!(last.injected, Some(0x8000_0030));
        assert!(!last.window);
    }

    #[test]
    fn test_pending_irq_waits_for_interrupt_flag() {
        let (hal, vmm) = create_vmm(VirtMode::Ept);
        let vm = create_vm(&vmm, CALLER, "guest", 1);
        hal.push_exit(Exit::Cpuid { leaf: 0 });
        hal.push_exit_with_rflags(Exit::InterruptWindow, RFLAGS_RESERVED_1 | RFLAGS_IF);
        let mut params = RunParams::new(vm, 0);
        params.irq = Some(0x21);
        assert_eq!(vmm.run_vcpu(CALLER, &params).unwrap().reason, VCpuExitReason::Halt);

        let entries = hal.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!((entries[0].injected, entries[0].window), (None, true));
        assert_eq!((entries[1].injected, entries[1].window), (None, true));
        assert_eq!((entries[2].injected, entries[2].window), (Some(0x8000_0021), false));
    }

    #[test]
    fn test_new_irq_does_not_replace_a_pending_one() {
        let (hal, vmm) = create_vmm(VirtMode::Ept);
        let vm = create_vm(&vmm, CALLER, "guest", 1);
        let mut params = RunParams::new(vm, 0);
        params.irq = Some(0x21);
        // Interrupts are off, so 0x21 is still queued when the guest halts.
        assert_eq!(vmm.run_vcpu(CALLER, &params).unwrap().reason, VCpuExitReason::Halt);
        assert_eq!(hal.entries()[0].injected, None);

        params.irq = Some(0x22);
        hal.push_exit_with_rflags(Exit::InterruptWindow, RFLAGS_RESERVED_1 | RFLAGS_IF);
        assert_eq!(vmm.run_vcpu(CALLER, &params).unwrap().reason, VCpuExitReason::Halt);
        let entries = hal.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].injected, Some(0x8000_0021));
    }

    #[test]
    fn test_guest_page_access() {
        let (hal, vmm) = create_vmm(VirtMode::Ept);
        let vm = create_vm(&vmm, CALLER, "guest", 1);
        let gpa = GuestPhysAddr::from_usize(0x7c00);

        // Nothing backs the page until the first write.
        let mut buf = [0u8; 4];
        assert_eq!(
            vmm.read_guest_page(CALLER, vm, gpa, &mut buf),
            Err(AxError::BadAddress)
        );
        vmm.write_guest_page(CALLER, vm, gpa, &[0xeb, 0xfe]).unwrap();
        assert_eq!(hal.calls("resolve(1, 0x7000, Write)"), 1);
        vmm.read_guest_page(CALLER, vm, gpa, &mut buf).unwrap();
        assert_eq!(buf, [0xeb, 0xfe, 0, 0]);

        let next = GuestPhysAddr::from_usize(0x7c02);
        vmm.write_guest_page(CALLER, vm, next, &[0x90]).unwrap();
        assert_eq!(hal.calls("resolve(1, 0x7000, Write)"), 1);
        let mut page = vec![0u8; PAGE_SIZE_4K];
        vmm.read_guest_page(CALLER, vm, GuestPhysAddr::from_usize(0x7000), &mut page)
            .unwrap();
        assert_eq!(page[0xc00..0xc04], [0xeb, 0xfe, 0x90, 0]);

        // MMIO window, past the end of RAM, and across a page boundary.
        for addr in [0xf000_0000, 4 * MIB, 0x7ffe] {
            let gpa = GuestPhysAddr::from_usize(addr);
            let mut buf = [0u8; 4];
            assert_eq!(
                vmm.read_guest_page(CALLER, vm, gpa, &mut buf),
                Err(AxError::InvalidInput)
            );
            assert_eq!(
                vmm.write_guest_page(CALLER, vm, gpa, &buf),
                Err(AxError::InvalidInput)
            );
        }
        assert_eq!(
            vmm.read_guest_page(OTHER_CALLER, vm, gpa, &mut buf),
            Err(AxError::PermissionDenied)
        );

        vmm.terminate_vm(CALLER, vm).unwrap();
        assert_eq!(
            vmm.read_guest_page(CALLER, vm, gpa, &mut buf),
            Err(AxError::NotFound)
        );
    }

    #[test]
    fn test_register_round_trip() {
        let (_hal, vmm) = create_vmm(VirtMode::Ept);
        let vm = create_vm(&vmm, CALLER, "guest", 1);

        let regs = vmm.read_registers(CALLER, vm, 0, RegMask::ALL).unwrap();
        assert_eq!(regs.rip, RESET_RIP);
        assert_eq!(regs.seg(SegReg::Cs).base, 0xffff_0000);
        // The processor cannot run with CR0.NE clear.
        assert_eq!(regs.crs.cr0, 0x6000_0030);

        let mut regs = regs;
        regs.gprs.rbx = 0x1234;
        regs.gprs.rsp = 0x7000;
        regs.rip = 0x7c00;
        regs.msrs.misc_enable = 1;
        regs.drs.dr0 = 0x4000;
        vmm.write_registers(CALLER, vm, 0, RegMask::ALL, &regs).unwrap();
        let back = vmm.read_registers(CALLER, vm, 0, RegMask::ALL).unwrap();
        assert_eq!(back.gprs, regs.gprs);
        assert_eq!(back.rip, 0x7c00);
        assert_eq!(back.msrs.misc_enable, 1);
        assert_eq!(back.drs.dr0, 0x4000);

        // Reset brings the power-on state back.
        let state = vmm.context().default_state();
        vmm.reset_vcpu(CALLER, vm, 0, &state).unwrap();
        let after = vmm.read_registers(CALLER, vm, 0, RegMask::GPRS).unwrap();
        assert_eq!(after.rip, RESET_RIP);
        assert_eq!(after.gprs.rbx, 0);
    }

    #[test]
    fn test_register_write_rejects_fixed_bit_violations() {
        let (_hal, vmm) = create_vmm(VirtMode::Ept);
        let vm = create_vm(&vmm, CALLER, "guest", 1);
        let good = vmm.read_registers(CALLER, vm, 0, RegMask::ALL).unwrap();

        let mut bad = good;
        bad.crs.cr0 = 1 << 31; // PG without PE
        assert_eq!(
            vmm.write_registers(CALLER, vm, 0, RegMask::CRS, &bad),
            Err(AxError::InvalidInput)
        );
        let mut bad = good;
        bad.crs.cr4 = 1 << 12;
        assert_eq!(
            vmm.write_registers(CALLER, vm, 0, RegMask::CRS, &bad),
            Err(AxError::InvalidInput)
        );
        assert_eq!(
            vmm.reset_vcpu(CALLER, vm, 0, &bad),
            Err(AxError::InvalidInput)
        );

        let now = vmm.read_registers(CALLER, vm, 0, RegMask::CRS).unwrap();
        assert_eq!(now.crs.cr0, good.crs.cr0);
        assert_eq!(now.crs.cr4, good.crs.cr4);
    }

    #[test]
    fn test_guest_control_register_writes() {
        let (hal, vmm) = create_vmm(VirtMode::Ept);
        let vm = create_vm(&vmm, CALLER, "guest", 1);

        // mov cr0, eax: real mode to protected mode.
        hal.push_exit(Exit::CrAccess {
            qual: 0,
            value: 0x11,
        });
        let report = vmm.run_vcpu(CALLER, &RunParams::new(vm, 0)).unwrap();
        assert_eq!(report.reason, VCpuExitReason::Halt);
        assert_eq!(report.regs.rip, RESET_RIP + 4);
        assert_eq!(hal.entries()[1].injected, None);
        let cr0 = vmm.read_registers(CALLER, vm, 0, RegMask::CRS).unwrap().crs.cr0;
        assert_eq!(cr0 & 0x1f, 0x11);

        // lmsw with TS set and PE clear keeps PE, clts clears TS again.
        hal.push_exit(Exit::CrAccess {
            qual: (3 << 4) | (0x8 << 16),
            value: 0,
        });
        assert_eq!(run(&vmm, vm), Ok(VCpuExitReason::Halt));
        let cr0 = vmm.read_registers(CALLER, vm, 0, RegMask::CRS).unwrap().crs.cr0;
        assert_eq!(cr0 & 0x1f, 0x19);
        hal.push_exit(Exit::CrAccess {
            qual: 2 << 4,
            value: 0,
        });
        assert_eq!(run(&vmm, vm), Ok(VCpuExitReason::Halt));
        let cr0 = vmm.read_registers(CALLER, vm, 0, RegMask::CRS).unwrap().crs.cr0;
        assert_eq!(cr0 & 0x1f, 0x11);

        // PG without PE faults and leaves CR0 alone.
        hal.push_exit(Exit::CrAccess {
            qual: 0,
            value: CR0_PG,
        });
        assert_eq!(run(&vmm, vm), Ok(VCpuExitReason::Halt));
        let entries = hal.entries();
        let n = entries.len();
        assert_eq!(entries[n - 1].injected, Some(0x8000_0b0d));
        assert_eq!(entries[n - 1].rip, entries[n - 2].rip);
        let cr0 = vmm.read_registers(CALLER, vm, 0, RegMask::CRS).unwrap().crs.cr0;
        assert_eq!(cr0 & (CR0_PG | CR0_PE), CR0_PE);
    }

    #[test]
    fn test_guest_enters_long_mode() {
        let (hal, vmm) = create_vmm(VirtMode::Ept);
        let vm = create_vm(&vmm, CALLER, "guest", 1);

        hal.push_exit(Exit::Wrmsr {
            index: msr::IA32_EFER,
            value: EFER_LME,
        });
        hal.push_exit(Exit::Wrmsr {
            index: msr::IA32_LSTAR,
            value: 0xffff_8000_0010_0000,
        });
        hal.push_exit(Exit::CrAccess {
            qual: 4,
            value: CR4_PAE,
        });
        hal.push_exit(Exit::CrAccess {
            qual: 0,
            value: CR0_PG | CR0_PE,
        });
        assert_eq!(run(&vmm, vm), Ok(VCpuExitReason::Halt));
        let entries = hal.entries();
        assert!(entries[..4].iter().all(|e| !e.long_mode && e.injected.is_none()));
        assert!(entries[4].long_mode);

        let regs = vmm
            .read_registers(CALLER, vm, 0, RegMask::MSRS | RegMask::CRS)
            .unwrap();
        assert_eq!(regs.msrs.efer, EFER_LME | EFER_LMA);
        assert_eq!(regs.msrs.lstar, 0xffff_8000_0010_0000);
        assert_ne!(regs.crs.cr4 & CR4_PAE, 0);

        // LME is locked while paging is on; the guest reads back its EFER.
        hal.push_exit(Exit::Wrmsr {
            index: msr::IA32_EFER,
            value: 0,
        });
        hal.push_exit(Exit::Rdmsr {
            index: msr::IA32_EFER,
        });
        let report = vmm.run_vcpu(CALLER, &RunParams::new(vm, 0)).unwrap();
        assert_eq!(report.reason, VCpuExitReason::Halt);
        assert_eq!(hal.entries()[6].injected, Some(0x8000_0b0d));
        assert_eq!((report.regs.gprs.rdx, report.regs.gprs.rax), (0, EFER_LME | EFER_LMA));

        // Turning paging off leaves IA-32e mode.
        hal.push_exit(Exit::CrAccess {
            qual: 0,
            value: CR0_PE,
        });
        assert_eq!(run(&vmm, vm), Ok(VCpuExitReason::Halt));
        assert!(!hal.entries().last().unwrap().long_mode);
        let regs = vmm.read_registers(CALLER, vm, 0, RegMask::MSRS).unwrap();
        assert_eq!(regs.msrs.efer, EFER_LME);
    }

    #[test]
    fn test_concurrent_run_is_busy() {
        let (hal, vmm) = create_vmm(VirtMode::Ept);
        let vm = create_vm(&vmm, CALLER, "guest", 1);
        let (entered, release) = hal.arm_gate();

        let runner = {
            let vmm = vmm.clone();
            thread::spawn(move || {
                set_current_cpu(1);
                run(&vmm, vm)
            })
        };
        entered.recv().unwrap();

        assert_eq!(run(&vmm, vm), Err(AxError::ResourceBusy));
        assert_eq!(
            vmm.read_registers(CALLER, vm, 0, RegMask::GPRS).err(),
            Some(AxError::ResourceBusy)
        );
        let state = vmm.context().default_state();
        assert_eq!(vmm.reset_vcpu(CALLER, vm, 0, &state), Err(AxError::ResourceBusy));
        let VmInfoResult::Info(info) = vmm.get_info(CALLER, 1).unwrap() else {
            panic!("expected summaries");
        };
        assert_eq!(info[0].vcpu_states, vec![VCpuState::Running]);

        vmm.set_pending_interrupt(CALLER, vm, 0, true).unwrap();
        assert_eq!(hal.calls("notify(1)"), 1);

        release.send(()).unwrap();
        assert_eq!(runner.join().unwrap(), Ok(VCpuExitReason::Halt));
        // A failed run does not poison the VM.
        let regs = vmm.read_registers(CALLER, vm, 0, RegMask::GPRS).unwrap();
        assert_eq!(regs.rip, RESET_RIP + 1);
    }

    #[test]
    fn test_terminate_running_vm() {
        let (hal, vmm) = create_vmm(VirtMode::Ept);
        let vm = create_vm(&vmm, CALLER, "guest", 2);
        let handle = vmm.lookup(CALLER, vm).unwrap();
        let (entered, release) = hal.arm_gate();

        let runner = {
            let vmm = vmm.clone();
            thread::spawn(move || {
                set_current_cpu(1);
                run(&vmm, vm)
            })
        };
        entered.recv().unwrap();

        vmm.terminate_vm(CALLER, vm).unwrap();
        assert_eq!(hal.calls("notify(1)"), 1);
        assert_eq!(
            handle.vcpu_states(),
            vec![VCpuState::RequestTerminate, VCpuState::Terminated]
        );
        // Still in use by the runner.
        assert_eq!(hal.calls("unmap(1)"), 0);
        assert!(!handle.is_torn_down());
        assert_eq!(vmm.get_info(CALLER, 4).unwrap(), VmInfoResult::Info(Vec::new()));
        assert_eq!(vmm.terminate_vm(CALLER, vm), Err(AxError::NotFound));

        release.send(()).unwrap();
        assert_eq!(runner.join().unwrap(), Ok(VCpuExitReason::Terminated));
        assert!(handle.is_torn_down());
        assert_eq!(hal.calls("unmap(1)"), 1);
        assert_eq!(hal.outstanding_frames(), 0);
        assert_eq!(vmm.context().vpids().outstanding(), 0);
        assert_eq!(run(&vmm, vm), Err(AxError::NotFound));
    }

    #[test]
    fn test_shutdown_waits_for_runners() {
        let (hal, vmm) = create_vmm(VirtMode::Ept);
        let vm = create_vm(&vmm, CALLER, "guest", 1);
        let handle = vmm.lookup(CALLER, vm).unwrap();
        let (entered, release) = hal.arm_gate();

        let runner = {
            let vmm = vmm.clone();
            thread::spawn(move || {
                set_current_cpu(1);
                run(&vmm, vm)
            })
        };
        entered.recv().unwrap();

        let stopper = {
            let vmm = vmm.clone();
            thread::spawn(move || vmm.shutdown())
        };
        while hal.calls("yield") == 0 {
            thread::yield_now();
        }
        // CPU 1 is still in guest mode, so nothing is disabled yet.
        assert_eq!(hal.calls("notify(1)"), 1);
        assert_eq!(hal.calls("disable(0)"), 0);
        assert_eq!(hal.calls("disable(1)"), 0);
        assert!(!handle.is_torn_down());

        release.send(()).unwrap();
        assert_eq!(runner.join().unwrap(), Ok(VCpuExitReason::Terminated));
        stopper.join().unwrap();
        assert!(handle.is_torn_down());
        assert_eq!(hal.calls("disable(0)"), 1);
        assert_eq!(hal.calls("disable(1)"), 1);
        assert_eq!(hal.outstanding_frames(), 0);
    }

    #[test]
    fn test_terminate_stopped_vm() {
        let (hal, vmm) = create_vmm(VirtMode::Ept);
        let vm = create_vm(&vmm, CALLER, "guest", 1);
        let vcpu = vmm.lookup(CALLER, vm).unwrap().vcpu(0).unwrap();
        vmm.terminate_vm(CALLER, vm).unwrap();
        assert_eq!(vcpu.state(), VCpuState::Terminated);
        assert_eq!(hal.calls("unmap(1)"), 1);
        assert_eq!(hal.calls("notify(0)"), 0);
        assert_eq!(hal.outstanding_frames(), 0);

        // Terminal: no transition leaves it.
        for to in [VCpuState::Stopped, VCpuState::Running] {
            assert!(!vcpu.transition(VCpuState::Terminated, to));
        }
        assert_eq!(vcpu.state(), VCpuState::Terminated);
    }

    #[test]
    fn test_state_transitions_are_checked() {
        let (_hal, vmm) = create_vmm(VirtMode::Ept);
        let vm = create_vm(&vmm, CALLER, "guest", 1);
        let vcpu = vmm.lookup(CALLER, vm).unwrap().vcpu(0).unwrap();

        // Matching current state, but not a lifecycle edge.
        assert!(!vcpu.transition(VCpuState::Stopped, VCpuState::RequestTerminate));
        // Legal edge, wrong current state.
        assert!(!vcpu.transition(VCpuState::Running, VCpuState::Stopped));
        assert_eq!(vcpu.state(), VCpuState::Stopped);

        assert!(vcpu.transition(VCpuState::Stopped, VCpuState::Running));
        assert!(vcpu.transition(VCpuState::Running, VCpuState::Stopped));
        assert_eq!(vcpu.state(), VCpuState::Stopped);
    }

    #[test]
    fn test_caller_stop_and_yield() {
        let (hal, vmm) = create_vmm(VirtMode::Ept);
        let vm = create_vm(&vmm, CALLER, "guest", 1);

        hal.must_stop.store(true, Ordering::SeqCst);
        assert_eq!(run(&vmm, vm), Ok(VCpuExitReason::None));
        assert!(hal.entries().is_empty());
        hal.must_stop.store(false, Ordering::SeqCst);

        hal.yield_once.store(true, Ordering::SeqCst);
        hal.push_exit(Exit::Cpuid { leaf: 0 });
        let report = vmm.run_vcpu(CALLER, &RunParams::new(vm, 0)).unwrap();
        assert_eq!(report.reason, VCpuExitReason::Halt);
        assert_eq!(report.regs.rip, RESET_RIP + 3);
        assert_eq!(hal.calls("yield"), 1);
    }

    #[test]
    fn test_failed_release_poisons_subsystem() {
        let (hal, vmm) = create_vmm(VirtMode::Ept);
        let vm = create_vm(&vmm, CALLER, "guest", 1);
        hal.fail_vmclear.store(true, Ordering::SeqCst);
        assert_eq!(
            vmm.read_registers(CALLER, vm, 0, RegMask::GPRS).err(),
            Some(AxError::BadState)
        );
        assert!(vmm.context().is_poisoned());
        assert_eq!(run(&vmm, vm), Err(AxError::BadState));
        assert_eq!(vmm.get_info(CALLER, 1).err(), Some(AxError::BadState));
    }

    #[test]
    fn test_svm_run() {
        let (hal, vmm) = create_vmm(VirtMode::Rvi);
        assert_eq!(vmm.context().vpids().max(), 15);
        let vm = create_vm(&vmm, CALLER, "guest", 1);

        let regs = vmm.read_registers(CALLER, vm, 0, RegMask::ALL).unwrap();
        assert_eq!(regs.rip, RESET_RIP);
        assert_ne!(regs.msrs.efer & EFER_SVME, 0);

        hal.push_exit(Exit::Cpuid { leaf: 0x4000_0000 });
        hal.push_exit(Exit::PortIn {
            port: 0x3f8,
            size: 1,
        });
        let report = vmm.run_vcpu(CALLER, &RunParams::new(vm, 0)).unwrap();
        let VCpuExitReason::Io(io) = report.reason else {
            panic!("expected port I/O, got {:?}", report.reason);
        };
        assert_eq!((io.port, io.size, io.is_in), (0x3f8, 1, true));
        assert_eq!(report.regs.rip, RESET_RIP + 3);
        assert_eq!(report.regs.gprs.rbx, u32::from_le_bytes(*b"AxVm") as u64);

        let mut params = RunParams::new(vm, 0);
        params.resume = Some(ExitResolution::IoIn { data: 0x55 });
        let report = vmm.run_vcpu(CALLER, &params).unwrap();
        assert_eq!(report.reason, VCpuExitReason::Halt);
        assert_eq!(report.regs.gprs.rax & 0xff, 0x55);
        assert_eq!(report.regs.rip, RESET_RIP + 4);
    }

    #[test]
    fn test_svm_vmmcall_and_interrupt_window() {
        let (hal, vmm) = create_vmm(VirtMode::Rvi);
        let vm = create_vm(&vmm, CALLER, "guest", 1);

        hal.push_exit(Exit::Vmcall);
        assert_eq!(run(&vmm, vm), Ok(VCpuExitReason::Halt));
        assert_eq!(hal.entries()[1].injected, Some(0x8000_0306));

        let mut params = RunParams::new(vm, 0);
        params.irq = Some(0x20);
        hal.push_exit_with_rflags(Exit::InterruptWindow, RFLAGS_RESERVED_1 | RFLAGS_IF);
        assert_eq!(vmm.run_vcpu(CALLER, &params).unwrap().reason, VCpuExitReason::Halt);
        let entries = hal.entries();
        assert!(entries[2].window);
        assert_eq!(entries[3].injected, Some(0x8000_0020));
        assert!(!entries[3].window);
    }

    #[test]
    fn test_svm_syscall_msrs_live_in_the_vmcb() {
        let (hal, vmm) = create_vmm(VirtMode::Rvi);
        let vm = create_vm(&vmm, CALLER, "guest", 1);

        hal.push_exit(Exit::Wrmsr {
            index: msr::IA32_EFER,
            value: EFER_LME,
        });
        hal.push_exit(Exit::Wrmsr {
            index: msr::IA32_STAR,
            value: 0x0023_0010_0000_0000,
        });
        hal.push_exit(Exit::Rdmsr {
            index: msr::IA32_EFER,
        });
        let report = vmm.run_vcpu(CALLER, &RunParams::new(vm, 0)).unwrap();
        assert_eq!(report.reason, VCpuExitReason::Halt);
        assert_eq!(report.regs.rip, RESET_RIP + 7);
        // SVME stays set underneath but the guest never sees it.
        assert_eq!((report.regs.gprs.rdx, report.regs.gprs.rax), (0, EFER_LME));
        assert!(hal.entries().iter().all(|e| e.injected.is_none()));

        let regs = vmm.read_registers(CALLER, vm, 0, RegMask::MSRS).unwrap();
        assert_eq!(regs.msrs.efer, EFER_LME | EFER_SVME);
        assert_eq!(regs.msrs.star, 0x0023_0010_0000_0000);

        hal.push_exit(Exit::Wrmsr {
            index: msr::IA32_EFER,
            value: 1 << 20,
        });
        assert_eq!(run(&vmm, vm), Ok(VCpuExitReason::Halt));
        assert_eq!(hal.entries()[5].injected, Some(0x8000_0b0d));
        let regs = vmm.read_registers(CALLER, vm, 0, RegMask::MSRS).unwrap();
        assert_eq!(regs.msrs.efer, EFER_LME | EFER_SVME);
    }

    #[test]
    fn test_svm_teardown_frees_asids() {
        let (hal, vmm) = create_vmm(VirtMode::Rvi);
        let vm = create_vm(&vmm, CALLER, "guest", 3);
        assert_eq!(vmm.context().vpids().outstanding(), 3);
        vmm.terminate_vm(CALLER, vm).unwrap();
        assert_eq!(vmm.context().vpids().outstanding(), 0);
        assert_eq!(hal.outstanding_frames(), 0);
    }
}
