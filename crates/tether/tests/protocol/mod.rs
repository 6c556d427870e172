
mod concurrency;
mod futures;
mod hostcall;
mod session;
