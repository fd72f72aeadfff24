//! Class codes and the class driver interface

use core::task::Poll;

use crate::{
    error::{Result, XferResult},
    host::HostContext,
    pipe::PipeHandle,
};

/// A class driver's slot in the dispatch table
///
/// Each kind normalizes one USB class code. The discriminant is the
/// index into [`ClassSet`] and the driver table.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
#[repr(u8)]
pub enum ClassKind {
    Audio,
    Cdc,
    Hid,
    Physical,
    Image,
    Printer,
    MassStorage,
    Hub,
    CdcData,
    SmartCard,
    ContentSecurity,
    Video,
    PersonalHealthcare,
    AudioVideo,
    Diagnostic,
    WirelessController,
    Miscellaneous,
    ApplicationSpecific,
    VendorSpecific,
}

const KINDS: [ClassKind; ClassKind::COUNT] = [
    ClassKind::Audio,
    ClassKind::Cdc,
    ClassKind::Hid,
    ClassKind::Physical,
    ClassKind::Image,
    ClassKind::Printer,
    ClassKind::MassStorage,
    ClassKind::Hub,
    ClassKind::CdcData,
    ClassKind::SmartCard,
    ClassKind::ContentSecurity,
    ClassKind::Video,
    ClassKind::PersonalHealthcare,
    ClassKind::AudioVideo,
    ClassKind::Diagnostic,
    ClassKind::WirelessController,
    ClassKind::Miscellaneous,
    ClassKind::ApplicationSpecific,
    ClassKind::VendorSpecific,
];

impl ClassKind {
    pub const COUNT: usize = 19;

    /// Map a `bInterfaceClass` code to its kind
    pub const fn from_class_code(code: u8) -> Option<Self> {
        Some(match code {
            0x01 => ClassKind::Audio,
            0x02 => ClassKind::Cdc,
            0x03 => ClassKind::Hid,
            0x05 => ClassKind::Physical,
            0x06 => ClassKind::Image,
            0x07 => ClassKind::Printer,
            0x08 => ClassKind::MassStorage,
            0x09 => ClassKind::Hub,
            0x0A => ClassKind::CdcData,
            0x0B => ClassKind::SmartCard,
            0x0D => ClassKind::ContentSecurity,
            0x0E => ClassKind::Video,
            0x0F => ClassKind::PersonalHealthcare,
            0x10 => ClassKind::AudioVideo,
            0xDC => ClassKind::Diagnostic,
            0xE0 => ClassKind::WirelessController,
            0xEF => ClassKind::Miscellaneous,
            0xFE => ClassKind::ApplicationSpecific,
            0xFF => ClassKind::VendorSpecific,
            _ => return None,
        })
    }

    pub const fn class_code(self) -> u8 {
        match self {
            ClassKind::Audio => 0x01,
            ClassKind::Cdc => 0x02,
            ClassKind::Hid => 0x03,
            ClassKind::Physical => 0x05,
            ClassKind::Image => 0x06,
            ClassKind::Printer => 0x07,
            ClassKind::MassStorage => 0x08,
            ClassKind::Hub => 0x09,
            ClassKind::CdcData => 0x0A,
            ClassKind::SmartCard => 0x0B,
            ClassKind::ContentSecurity => 0x0D,
            ClassKind::Video => 0x0E,
            ClassKind::PersonalHealthcare => 0x0F,
            ClassKind::AudioVideo => 0x10,
            ClassKind::Diagnostic => 0xDC,
            ClassKind::WirelessController => 0xE0,
            ClassKind::Miscellaneous => 0xEF,
            ClassKind::ApplicationSpecific => 0xFE,
            ClassKind::VendorSpecific => 0xFF,
        }
    }

    pub fn from_index(index: u8) -> Option<Self> {
        KINDS.get(index as usize).copied()
    }

    pub const fn index(self) -> usize {
        self as usize
    }
}

bitflags::bitflags! {
    /// The classes mounted on a device
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct ClassSet : u32 {
        const AUDIO = 1 << ClassKind::Audio as u32;
        const CDC = 1 << ClassKind::Cdc as u32;
        const HID = 1 << ClassKind::Hid as u32;
        const PHYSICAL = 1 << ClassKind::Physical as u32;
        const IMAGE = 1 << ClassKind::Image as u32;
        const PRINTER = 1 << ClassKind::Printer as u32;
        const MASS_STORAGE = 1 << ClassKind::MassStorage as u32;
        const HUB = 1 << ClassKind::Hub as u32;
        const CDC_DATA = 1 << ClassKind::CdcData as u32;
        const SMART_CARD = 1 << ClassKind::SmartCard as u32;
        const CONTENT_SECURITY = 1 << ClassKind::ContentSecurity as u32;
        const VIDEO = 1 << ClassKind::Video as u32;
        const PERSONAL_HEALTHCARE = 1 << ClassKind::PersonalHealthcare as u32;
        const AUDIO_VIDEO = 1 << ClassKind::AudioVideo as u32;
        const DIAGNOSTIC = 1 << ClassKind::Diagnostic as u32;
        const WIRELESS_CONTROLLER = 1 << ClassKind::WirelessController as u32;
        const MISCELLANEOUS = 1 << ClassKind::Miscellaneous as u32;
        const APPLICATION_SPECIFIC = 1 << ClassKind::ApplicationSpecific as u32;
        const VENDOR_SPECIFIC = 1 << ClassKind::VendorSpecific as u32;
    }
}

#[cfg(feature = "defmt-03")]
impl defmt_03::Format for ClassSet {
    fn format(&self, f: defmt_03::Formatter) {
        defmt_03::write!(f, "ClassSet({=u32:#x})", self.bits())
    }
}

impl From<ClassKind> for ClassSet {
    fn from(kind: ClassKind) -> Self {
        ClassSet::from_bits_truncate(1 << kind as u32)
    }
}

impl ClassSet {
    pub fn contains_kind(&self, kind: ClassKind) -> bool {
        self.contains(ClassSet::from(kind))
    }

    /// Iterate over the mounted kinds, lowest index first
    pub fn kinds(self) -> impl Iterator<Item = ClassKind> {
        KINDS.into_iter().filter(move |&kind| self.contains_kind(kind))
    }
}

/// A host-side class driver
///
/// The host calls `open` once for every interface whose class maps to the
/// driver's [`ClassKind`]. `open` is a subtask: the host polls it until it's
/// ready, and the driver keeps whatever state it needs between polls.
pub trait ClassDriver {
    /// Called once, when the host stack initializes
    fn init(&mut self) {}

    /// Bind to an interface
    ///
    /// `descriptors` starts at the interface descriptor and runs to the end
    /// of the configuration. On success, return the number of bytes that
    /// belong to this driver, so the host can continue at the next interface.
    fn open(
        &mut self,
        host: &mut dyn HostContext,
        dev_addr: u8,
        descriptors: &[u8],
    ) -> Poll<Result<usize>>;

    /// A transfer on one of the driver's pipes finished
    ///
    /// Runs in the interrupt handler.
    fn isr(&mut self, pipe: PipeHandle, result: XferResult, bytes: usize);

    /// The device went away. Every pipe it had is already closing.
    fn close(&mut self, dev_addr: u8);
}

#[cfg(test)]
mod test {
    use super::{ClassKind, ClassSet, KINDS};

    #[test]
    fn class_codes() {
        assert_eq!(ClassKind::from_class_code(0x03), Some(ClassKind::Hid));
        assert_eq!(ClassKind::from_class_code(0x09), Some(ClassKind::Hub));
        assert_eq!(ClassKind::from_class_code(0xFF), Some(ClassKind::VendorSpecific));
        assert_eq!(ClassKind::from_class_code(0x04), None);
        assert_eq!(ClassKind::from_class_code(0x00), None);
        for kind in KINDS {
            assert_eq!(ClassKind::from_class_code(kind.class_code()), Some(kind));
        }
    }

    #[test]
    fn indices() {
        for (idx, kind) in KINDS.into_iter().enumerate() {
            assert_eq!(kind.index(), idx);
            assert_eq!(ClassKind::from_index(idx as u8), Some(kind));
        }
        assert_eq!(ClassKind::from_index(ClassKind::COUNT as u8), None);
        assert_eq!(ClassKind::from_index(0xFF), None);
    }

    #[test]
    fn sets() {
        let mut set = ClassSet::empty();
        set |= ClassKind::Hid.into();
        set |= ClassKind::Hub.into();
        assert!(set.contains_kind(ClassKind::Hid));
        assert!(!set.contains_kind(ClassKind::Cdc));
        assert_eq!(set, ClassSet::HID | ClassSet::HUB);
        let mut kinds = set.kinds();
        assert_eq!(kinds.next(), Some(ClassKind::Hid));
        assert_eq!(kinds.next(), Some(ClassKind::Hub));
        assert_eq!(kinds.next(), None);
    }
}
