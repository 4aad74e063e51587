pub mod ot;
