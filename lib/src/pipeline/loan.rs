//! Bookkeeping of decoder buffers lent to the converter.
//!
//! A decoded frame stays in the decoder's CAPTURE buffer while the converter reads it through
//! a `USERPTR` plane. The decoder must not get that buffer back before the conversion is over.
//! Each such loan is recorded here, and only the pipeline moves it forward:
//! `Lent` → `Converted` → `Returned`.
use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    Decoder,
    Converter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoanState {
    /// Queued to the borrower.
    Lent,
    /// The borrower released it after producing its output.
    Converted,
    /// Given back to the owner.
    Returned,
}

impl fmt::Display for LoanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Loan {
    pub owner: Engine,
    pub index: usize,
    pub borrower: Engine,
    pub state: LoanState,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoanError {
    #[error("buffer {0} is already lent")]
    AlreadyLent(usize),
    #[error("buffer {0} is not lent")]
    NotLent(usize),
    #[error("loan of buffer {0} cannot go from {1} to {2}")]
    InvalidTransition(usize, LoanState, LoanState),
}

/// Outstanding loans of decoder CAPTURE buffers to the converter.
#[derive(Debug, Default)]
pub struct LoanBook {
    loans: Vec<Loan>,
}

impl LoanBook {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn lend(&mut self, index: usize) -> Result<(), LoanError> {
        if self.get(index).is_some() {
            return Err(LoanError::AlreadyLent(index));
        }
        self.loans.push(Loan {
            owner: Engine::Decoder,
            index,
            borrower: Engine::Converter,
            state: LoanState::Lent,
        });
        Ok(())
    }

    pub fn get(&self, index: usize) -> Option<&Loan> {
        self.loans.iter().find(|l| l.index == index)
    }

    fn transition(
        &mut self,
        index: usize,
        from: LoanState,
        to: LoanState,
    ) -> Result<&mut Loan, LoanError> {
        let loan = self
            .loans
            .iter_mut()
            .find(|l| l.index == index)
            .ok_or(LoanError::NotLent(index))?;
        if loan.state != from {
            return Err(LoanError::InvalidTransition(index, loan.state, to));
        }
        loan.state = to;
        Ok(loan)
    }

    pub fn mark_converted(&mut self, index: usize) -> Result<(), LoanError> {
        self.transition(index, LoanState::Lent, LoanState::Converted)
            .map(|_| ())
    }

    /// Close a converted loan. The owner may reuse the buffer afterwards.
    pub fn settle(&mut self, index: usize) -> Result<Loan, LoanError> {
        let loan = *self.transition(index, LoanState::Converted, LoanState::Returned)?;
        self.loans.retain(|l| l.index != index);
        Ok(loan)
    }

    /// Number of buffers the owner cannot use right now.
    pub fn outstanding(&self) -> usize {
        self.loans.len()
    }

    pub fn clear(&mut self) {
        self.loans.clear();
    }
}
