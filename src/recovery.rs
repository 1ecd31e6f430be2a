use crate::Nv;
use crate::error::Error;
use crate::internal::{PageIndex, Scan, ScanMode, ThinPageState};
use crate::platform::Platform;
use crate::raw::{PAGE_HEADER_SIZE, read_bytes};
use alloc::vec::Vec;
#[cfg(feature = "defmt")]
use defmt::{trace, warn};

impl<T> Nv<T>
where
    T: Platform,
{
    /// Rebuilds the page table from flash and brings the pool back into a consistent state:
    /// torn erases are redone, duplicates left by interrupted updates are dropped and an
    /// interrupted compaction is completed. Only read failures are reported, a mutation that gets
    /// refused is logged and retried on the next call.
    pub(crate) fn load_pages(&mut self) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("load_pages");

        #[cfg(feature = "debug-logs")]
        println!("recovery: load_pages");

        self.reserve = None;
        let mut erased = Vec::new();
        let mut sources = Vec::new();
        let mut targets = Vec::new();

        for index in 0..self.pages.len() {
            let page = PageIndex(index);
            let state: ThinPageState = self.read_page_header(page)?.state().into();
            self.pages[index].reset(state);

            match state {
                ThinPageState::Reserve => {
                    if self.is_page_clean(page)? {
                        erased.push(page);
                        continue;
                    }

                    #[cfg(feature = "defmt")]
                    warn!("page {} has an erased header but is not empty", index);

                    #[cfg(feature = "debug-logs")]
                    println!("recovery: page {index} has an erased header but is not empty");

                    match self.erase_page(page) {
                        Ok(()) => erased.push(page),
                        Err(Error::LowVoltage) => self.pages[index].state = ThinPageState::Corrupt,
                        Err(e) => return Err(e),
                    }
                }
                ThinPageState::Target => targets.push(page),
                ThinPageState::Compacting => sources.push(page),
                ThinPageState::InUse | ThinPageState::Corrupt => {}
            }
        }

        self.reserve = erased.first().copied();

        let mut superseded = false;
        for page in self.active_pages() {
            if let Scan::Done { superseded: seen } = self.scan_page(page, ScanMode::Census)? {
                superseded |= seen;
            }
        }
        if superseded {
            for page in self.active_pages() {
                self.scan_page(page, ScanMode::Dedupe)?;
            }
            for page in self.active_pages() {
                self.scan_page(page, ScanMode::Census)?;
            }
        }

        tolerate(self.resume_compaction(&sources, &targets))?;

        // a fresh pool, or an interrupted compaction that left two erased pages behind
        for page in erased {
            if Some(page) == self.reserve || self.pages[page.0].state != ThinPageState::Reserve {
                continue;
            }
            tolerate(self.format_page(page))?;
        }

        self.load_hardware_id()?;

        if self.reserve.is_none() {
            #[cfg(feature = "defmt")]
            warn!("no reserve page, compaction unavailable");

            #[cfg(feature = "debug-logs")]
            println!("recovery: no reserve page, compaction unavailable");
        }

        #[cfg(feature = "debug-logs")]
        for page in &self.pages {
            println!("recovery: {page:?}");
        }

        Ok(())
    }

    fn resume_compaction(
        &mut self,
        sources: &[PageIndex],
        targets: &[PageIndex],
    ) -> Result<(), Error> {
        let outcome = match (sources.first().copied(), targets.first().copied()) {
            (Some(source), Some(target)) => {
                #[cfg(feature = "defmt")]
                warn!("resuming compaction of page {} into page {}", source.0, target.0);

                #[cfg(feature = "debug-logs")]
                println!("recovery: resuming compaction of page {} into page {}", source.0, target.0);

                match self.finish_compaction(source, target) {
                    // an aborted copy took up room the remaining records need
                    Err(Error::FlashFull) => self.restart_compaction(source, target),
                    other => other,
                }
            }
            (Some(source), None) if self.reserve.is_some() => {
                #[cfg(feature = "defmt")]
                warn!("restarting compaction of page {}", source.0);

                #[cfg(feature = "debug-logs")]
                println!("recovery: restarting compaction of page {}", source.0);

                match self.begin_compaction(source) {
                    Ok(target) => self.finish_compaction(source, target),
                    Err(e) => Err(e),
                }
            }
            (Some(_source), None) => {
                #[cfg(feature = "defmt")]
                warn!("page {} is flagged for compaction but there is no reserve", _source.0);

                #[cfg(feature = "debug-logs")]
                println!("recovery: page {} is flagged for compaction but there is no reserve", _source.0);

                Ok(())
            }
            (None, Some(target)) => self.promote(target),
            (None, None) => Ok(()),
        };
        outcome?;

        // only one compaction runs at a time, anything beyond that is promoted as is
        for &target in targets.iter().skip(1) {
            if self.pages[target.0].state == ThinPageState::Target {
                self.promote(target)?;
            }
        }

        Ok(())
    }

    /// Completes a compaction that recovery had to leave pending, typically because the supply
    /// was low at the time. Records must not be placed on or removed from a page that is still
    /// being compacted, a restart would bring back the old content.
    pub(crate) fn settle_compaction(&mut self) -> Result<(), Error> {
        let pages_in = |state: ThinPageState| -> Vec<PageIndex> {
            self.pages
                .iter()
                .enumerate()
                .filter(|(_, page)| page.state == state)
                .map(|(index, _)| PageIndex(index))
                .collect()
        };
        let sources = pages_in(ThinPageState::Compacting);
        let targets = pages_in(ThinPageState::Target);

        if targets.is_empty() && (sources.is_empty() || self.reserve.is_none()) {
            return Ok(());
        }

        #[cfg(feature = "debug-logs")]
        println!("recovery: settling pending compaction");

        self.resume_compaction(&sources, &targets)
    }

    /// Throws away what has been copied to `target` so far and compacts `source` from scratch.
    fn restart_compaction(&mut self, source: PageIndex, target: PageIndex) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        warn!("page {} ran out of room, restarting compaction of page {}", target.0, source.0);

        #[cfg(feature = "debug-logs")]
        println!("recovery: page {} ran out of room, restarting compaction of page {}", target.0, source.0);

        self.erase_page(target)?;
        self.reserve = Some(target);
        self.restore_hardware_id(target)?;

        let target = self.begin_compaction(source)?;
        self.finish_compaction(source, target)
    }

    /// Whether the record log of a page reads as erased. The hardware id slot is not checked.
    fn is_page_clean(&mut self, page: PageIndex) -> Result<bool, Error> {
        let mut chunk = [0u8; 64];
        let mut offset = PAGE_HEADER_SIZE as usize;
        let end = self.page_end() as usize;
        while offset < end {
            let n = chunk.len().min(end - offset);
            let address = self.flash_offset(page, offset as u16);
            read_bytes(&mut self.hal, address, &mut chunk[..n])?;
            if chunk[..n].iter().any(|&b| b != 0xFF) {
                return Ok(false);
            }
            offset += n;
        }
        Ok(true)
    }
}

/// Mutations refused during recovery are repeated on the next attempt.
fn tolerate(result: Result<(), Error>) -> Result<(), Error> {
    match result {
        Err(Error::LowVoltage) | Err(Error::VerificationFailed) | Err(Error::FlashFull) => {
            #[cfg(feature = "defmt")]
            warn!("recovery step skipped: {}", result);

            #[cfg(feature = "debug-logs")]
            println!("recovery: step skipped: {result:?}");

            Ok(())
        }
        other => other,
    }
}
