mod backup;
mod import;
mod restore;
mod scheduling;
mod support;
