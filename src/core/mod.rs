pub mod appx;
pub mod audit;
pub mod cancel;
pub mod diagnostic;
pub mod executor;
pub mod folder;
pub mod permissions;
pub mod powershell;
pub mod process;
pub mod removal;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;
