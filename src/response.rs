//! Checking of query and move response streams

use dicom_object::InMemDicomObject;
use dimse::{DimseResponse, StatusOutcome};
use tracing::debug;

use crate::error::{PacsError, Result};

/// Iterator adaptor over the raw responses of one exchange.
///
/// Yields the payload of every Pending or Success response in arrival
/// order. Responses without a payload (such as the final Success that ends a
/// listing) are skipped. The first Failure status is yielded as
/// [`PacsError::ProtocolFailure`] and ends the stream, as does a transport
/// error.
pub struct ResponseChecker<I> {
    responses: I,
    finished: bool,
}

impl<I> ResponseChecker<I>
where
    I: Iterator<Item = dimse::Result<DimseResponse>>,
{
    pub fn new(responses: I) -> Self {
        Self {
            responses,
            finished: false,
        }
    }

    /// Consume the stream, discarding payloads, and surface any failure
    pub fn drain(self) -> Result<usize> {
        let mut count = 0;
        for item in self {
            item?;
            count += 1;
        }
        Ok(count)
    }
}

impl<I> Iterator for ResponseChecker<I>
where
    I: Iterator<Item = dimse::Result<DimseResponse>>,
{
    type Item = Result<InMemDicomObject>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            let response = match self.responses.next()? {
                Ok(response) => response,
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e.into()));
                }
            };

            match response.outcome() {
                StatusOutcome::Failure(code) => {
                    self.finished = true;
                    return Some(Err(PacsError::ProtocolFailure(code)));
                }
                outcome => {
                    if let Some(progress) = &response.progress {
                        debug!(
                            "{}: {} remaining, {} completed, {} failed",
                            outcome, progress.remaining, progress.completed, progress.failed
                        );
                    }
                    if let Some(dataset) = response.dataset {
                        return Some(Ok(dataset));
                    }
                }
            }
        }
        None
    }
}

/// Wrap a response stream in a [`ResponseChecker`]
pub fn checked<I>(responses: I) -> ResponseChecker<I::IntoIter>
where
    I: IntoIterator<Item = dimse::Result<DimseResponse>>,
{
    ResponseChecker::new(responses.into_iter())
}
