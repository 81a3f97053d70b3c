use std::fs::File;
use std::io::Read;
use std::path::Path;
use crate::content::TraceData;
use crate::error::{Error, Result};

/// Opens a file for a single sequential pass
pub fn get_reader(file: File) -> std::io::Result<Box<dyn Read>> {
    // Compatibility on other systems
    #[cfg(not(unix))]
    {
        use std::io::BufReader;
        // 4096 is the standard block size (or a multiple of it) on most systems
        const BUFFER_SIZE: usize = 16 * 4096;
        Ok(Box::new(BufReader::with_capacity(BUFFER_SIZE, file)))
    }
    // Memory map the file on unix systems, traces recorded over long intervals get large
    #[cfg(unix)]
    {
        use std::io::Cursor;
        use memmap2::{Advice, Mmap};
        if file.metadata()?.len() == 0 {
            // Mapping an empty file fails on some platforms
            return Ok(Box::new(std::io::empty()));
        }
        unsafe {
            let m = Mmap::map(&file)?;
            m.advise(Advice::Sequential)?;
            Ok(Box::new(Cursor::new(m)))
        }
    }
}

/// Loads recorded per-client requests
pub fn load_trace(path: &Path) -> Result<TraceData> {
    let file = File::open(path).map_err(|e| Error::config(format!("Couldn't open the trace at {}: {e}", path.display())))?;
    let reader = get_reader(file).map_err(|e| Error::config(format!("Couldn't read the trace at {}: {e}", path.display())))?;
    serde_json::from_reader(reader).map_err(|e| Error::config(format!("Couldn't parse the trace at {}: {e}", path.display())))
}
