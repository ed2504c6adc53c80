//! 页表项
//!
//! 硬件格式是 i386 风格的 32 位 PTE，9~11 位由软件使用。内核其余部分只通过类型化的 [`Pte`] 访问，
//! 由它保证“存在 / 按需清零 / 按需填充 / 已换出”四者互斥

use core::fmt;

use bitflags::bitflags;
use defines::config::PTES_PER_TABLE;

/// 物理页帧号
pub type Ppn = usize;

/// PTE 中帧号字段的宽度
pub const FRAME_BITS: u32 = 20;
const FRAME_SHIFT: u32 = 12;
const FRAME_MASK: u32 = (1 << FRAME_BITS) - 1;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct RawFlags: u32 {
        const P = 1 << 0;
        const W = 1 << 1;
        const U = 1 << 2;
        const A = 1 << 5;
        const D = 1 << 6;
        const COW = 1 << 9;
        const ZERO = 1 << 10;
        const FILL = 1 << 11;
    }
}

bitflags! {
    /// 与页状态无关的权限与访问位
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct PteFlags: u8 {
        const WRITABLE = 1 << 0;
        const USER = 1 << 1;
        const ACCESSED = 1 << 2;
        const DIRTY = 1 << 3;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageState {
    Absent,
    /// 首次访问时分配一个全零的页
    DemandZero,
    /// 首次访问时从 region 的后备文件读入
    DemandFill,
    Present { ppn: Ppn, cow: bool },
    /// 已换出到交换区的第 `slot` 槽
    Swapped { slot: usize, cow: bool },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pte {
    pub state: PageState,
    pub flags: PteFlags,
}

impl Pte {
    pub const ABSENT: Self = Self {
        state: PageState::Absent,
        flags: PteFlags::empty(),
    };

    pub const fn new(state: PageState, flags: PteFlags) -> Self {
        Self { state, flags }
    }

    pub fn is_present(&self) -> bool {
        matches!(self.state, PageState::Present { .. })
    }

    pub fn is_writable(&self) -> bool {
        self.flags.contains(PteFlags::WRITABLE)
    }

    pub fn ppn(&self) -> Option<Ppn> {
        match self.state {
            PageState::Present { ppn, .. } => Some(ppn),
            _ => None,
        }
    }

    pub fn encode(self) -> RawPte {
        let mut raw = RawFlags::empty();
        raw.set(RawFlags::W, self.flags.contains(PteFlags::WRITABLE));
        raw.set(RawFlags::U, self.flags.contains(PteFlags::USER));
        raw.set(RawFlags::A, self.flags.contains(PteFlags::ACCESSED));
        raw.set(RawFlags::D, self.flags.contains(PteFlags::DIRTY));
        let frame = match self.state {
            PageState::Absent => 0,
            PageState::DemandZero => {
                raw |= RawFlags::ZERO;
                0
            }
            PageState::DemandFill => {
                raw |= RawFlags::FILL;
                0
            }
            PageState::Present { ppn, cow } => {
                raw |= RawFlags::P;
                raw.set(RawFlags::COW, cow);
                ppn
            }
            // 帧号为 0 留给“不存在”，因此槽号加一存放
            PageState::Swapped { slot, cow } => {
                raw.set(RawFlags::COW, cow);
                slot + 1
            }
        };
        debug_assert!(frame <= FRAME_MASK as usize, "frame {frame:#x} overflows pte");
        RawPte(raw.bits() | ((frame as u32 & FRAME_MASK) << FRAME_SHIFT))
    }
}

/// 硬件格式的页表项
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct RawPte(u32);

impl RawPte {
    pub const EMPTY: Self = Self(0);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    fn raw_flags(self) -> RawFlags {
        RawFlags::from_bits_retain(self.0 & !(FRAME_MASK << FRAME_SHIFT))
    }

    pub fn frame(self) -> usize {
        ((self.0 >> FRAME_SHIFT) & FRAME_MASK) as usize
    }

    pub fn is_present(self) -> bool {
        self.raw_flags().contains(RawFlags::P)
    }

    pub fn is_writable(self) -> bool {
        self.raw_flags().contains(RawFlags::W)
    }

    pub fn is_cow(self) -> bool {
        self.raw_flags().contains(RawFlags::COW)
    }

    pub fn is_zero(self) -> bool {
        self.raw_flags().contains(RawFlags::ZERO)
    }

    pub fn is_fill(self) -> bool {
        self.raw_flags().contains(RawFlags::FILL)
    }

    /// 不一致的编码（如同时存在且按需清零）返回 `None`
    pub fn decode(self) -> Option<Pte> {
        let raw = self.raw_flags();
        if !RawFlags::all().contains(raw) {
            return None;
        }
        let mut flags = PteFlags::empty();
        flags.set(PteFlags::WRITABLE, raw.contains(RawFlags::W));
        flags.set(PteFlags::USER, raw.contains(RawFlags::U));
        flags.set(PteFlags::ACCESSED, raw.contains(RawFlags::A));
        flags.set(PteFlags::DIRTY, raw.contains(RawFlags::D));

        let cow = raw.contains(RawFlags::COW);
        let frame = self.frame();
        let demand = raw & (RawFlags::ZERO | RawFlags::FILL);
        let state = if raw.contains(RawFlags::P) {
            if !demand.is_empty() {
                return None;
            }
            PageState::Present { ppn: frame, cow }
        } else if demand == RawFlags::ZERO || demand == RawFlags::FILL {
            if cow || frame != 0 {
                return None;
            }
            if demand == RawFlags::ZERO {
                PageState::DemandZero
            } else {
                PageState::DemandFill
            }
        } else if !demand.is_empty() {
            return None;
        } else if frame != 0 {
            PageState::Swapped {
                slot: frame - 1,
                cow,
            }
        } else if cow {
            return None;
        } else {
            PageState::Absent
        };
        Some(Pte { state, flags })
    }
}

impl fmt::Debug for RawPte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawPte({:#010x})", self.0)
    }
}

/// 一张页表，覆盖 `TABLE_SPAN` 字节
pub struct PageTable {
    entries: [RawPte; PTES_PER_TABLE],
}

impl PageTable {
    pub fn new() -> Box<Self> {
        Box::new(Self {
            entries: [RawPte::EMPTY; PTES_PER_TABLE],
        })
    }

    /// # Panics
    ///
    /// 表项编码损坏意味着内核状态已不可信
    pub fn get(&self, idx: usize) -> Pte {
        let raw = self.entries[idx];
        raw.decode()
            .unwrap_or_else(|| panic!("corrupted pte {raw:?} at index {idx}"))
    }

    pub fn set(&mut self, idx: usize, pte: Pte) {
        self.entries[idx] = pte.encode();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|raw| *raw == RawPte::EMPTY)
    }
}
