//! USB analog/digital I/O interface.
//!
//! Hardware drivers are external collaborators; the core only depends on
//! this trait: sample the unit once per captured frame at the current ring
//! index, and format the header fragment and per-row values for the data
//! file. When no board is configured the session simply holds no
//! implementation.

use crate::error::AppResult;

/// Per-frame sampled auxiliary I/O.
pub trait UsbIo: Send {
    /// Board identification for logging.
    fn name(&self) -> &str;

    /// Acquire one sample at ring index `index`.
    fn sample(&mut self, index: usize);

    /// Column description for the `#DATAFORMAT` header, e.g. `AD0;AD1;DI`.
    fn format_header(&self) -> String;

    /// Semicolon-separated values for the sample stored at `index`.
    fn format_sample(&self, index: usize) -> String;
}

/// Open the configured board. The stock build knows no hardware; a non-empty
/// board name is reported back as an error so startup fails loudly instead
/// of recording a file with silently missing columns.
pub fn open_usbio(board: &str, _param_ad: &str, _param_di: &str) -> AppResult<Box<dyn UsbIo>> {
    Err(crate::error::GazeError::UsbIo(format!(
        "no driver available for USBIO_BOARD \"{board}\""
    )))
}

#[cfg(test)]
pub mod testing {
    use super::UsbIo;

    /// Deterministic stand-in: AD value = index, DI value = index mod 2.
    pub struct FakeUsbIo {
        pub sampled: Vec<usize>,
    }

    impl FakeUsbIo {
        pub fn new() -> Self {
            Self { sampled: Vec::new() }
        }
    }

    impl UsbIo for FakeUsbIo {
        fn name(&self) -> &str {
            "fake"
        }

        fn sample(&mut self, index: usize) {
            self.sampled.push(index);
        }

        fn format_header(&self) -> String {
            "AD0;DI".to_string()
        }

        fn format_sample(&self, index: usize) -> String {
            format!("{};{}", index, index % 2)
        }
    }

    #[test]
    fn test_fake_usbio_formats() {
        let mut io = FakeUsbIo::new();
        io.sample(3);
        assert_eq!(io.sampled, vec![3]);
        assert_eq!(io.format_header(), "AD0;DI");
        assert_eq!(io.format_sample(3), "3;1");
    }
}
