mod compress;
mod pool;
mod resolve;
mod storage;
